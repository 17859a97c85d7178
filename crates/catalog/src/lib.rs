//! Assembles the active mitigation pattern catalog for a run.
//!
//! Built-ins load first, then validated custom patterns, then overrides,
//! then the disabled list. The resulting catalog is immutable for the run
//! and its iteration order is deterministic: built-ins in declaration
//! order, customs in configuration order.

use std::collections::HashMap;
use tracing::{debug, warn};

pub mod builtins;
pub mod config;
pub mod pattern;

pub use config::{
    ConfigError, ErrorCode, MitigationConfiguration, PatternOverride, RESERVED_NAMES,
};
pub use pattern::{
    ArgConstraint, CompiledPattern, CriteriaKind, MatchCriteria, MitigationPattern,
};

#[derive(Debug, Clone, Default)]
/// Immutable, compiled pattern catalog.
pub struct PatternCatalog {
    patterns: Vec<CompiledPattern>,
    by_id: HashMap<String, usize>,
}

impl PatternCatalog {
    /// Patterns in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &CompiledPattern> {
        self.patterns.iter()
    }

    pub fn get(&self, id: &str) -> Option<&CompiledPattern> {
        self.by_id.get(id).map(|&i| &self.patterns[i])
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    fn push(&mut self, compiled: CompiledPattern) {
        let id = compiled.id().to_string();
        if let Some(&existing) = self.by_id.get(&id) {
            self.patterns[existing] = compiled;
        } else {
            self.by_id.insert(id, self.patterns.len());
            self.patterns.push(compiled);
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(idx) = self.by_id.remove(id) else {
            return false;
        };
        self.patterns.remove(idx);
        for slot in self.by_id.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
/// Result of assembling a catalog: the catalog itself plus the structured
/// errors and warnings the configuration produced. Errors reject only the
/// element that caused them, never the whole configuration.
pub struct CatalogBuild {
    pub catalog: PatternCatalog,
    pub errors: Vec<ConfigError>,
    pub warnings: Vec<String>,
}

/// Builds the active catalog from built-ins plus user configuration.
pub fn build_catalog(config: &MitigationConfiguration) -> CatalogBuild {
    let mut catalog = PatternCatalog::default();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for builtin in builtins::builtin_patterns() {
        let compiled = CompiledPattern::compile(builtin)
            .expect("built-in pattern regexes are valid by construction");
        catalog.push(compiled);
    }
    debug!(builtins = catalog.len(), "loaded built-in patterns");

    let mut seen_custom: HashMap<String, usize> = HashMap::new();
    for (idx, custom) in config.custom_patterns.iter().enumerate() {
        if let Some(first) = seen_custom.get(&custom.id) {
            errors.push(ConfigError {
                code: ErrorCode::DuplicatePattern,
                path: format!("custom_patterns[{idx}].id"),
                message: format!(
                    "pattern id '{}' already declared at custom_patterns[{first}]",
                    custom.id
                ),
            });
            continue;
        }

        let pattern_errors = config::validate_pattern(custom, idx);
        if !pattern_errors.is_empty() {
            for e in &pattern_errors {
                warn!(code = %e.code, path = %e.path, "rejected custom pattern");
            }
            errors.extend(pattern_errors);
            continue;
        }

        seen_custom.insert(custom.id.clone(), idx);
        if catalog.get(&custom.id).is_some() {
            warnings.push(format!(
                "custom pattern '{}' shadows a built-in pattern",
                custom.id
            ));
        }
        let mut accepted = custom.clone();
        accepted.builtin = false;
        match CompiledPattern::compile(accepted) {
            Ok(compiled) => catalog.push(compiled),
            Err(e) => {
                // Complexity validation passed but the regex engine still
                // refused the pattern.
                errors.push(ConfigError {
                    code: ErrorCode::InvalidPattern,
                    path: format!("custom_patterns[{idx}].criteria.name_pattern"),
                    message: e.to_string(),
                });
            }
        }
    }

    apply_overrides(&mut catalog, config, &mut warnings);

    for (idx, id) in config.disabled_patterns.iter().enumerate() {
        if !catalog.remove(id) {
            warnings.push(format!(
                "disabled_patterns[{idx}] references unknown pattern '{id}'"
            ));
        }
    }

    for w in &warnings {
        warn!("{w}");
    }
    debug!(
        patterns = catalog.len(),
        errors = errors.len(),
        warnings = warnings.len(),
        "catalog assembled"
    );

    CatalogBuild {
        catalog,
        errors,
        warnings,
    }
}

fn apply_overrides(
    catalog: &mut PatternCatalog,
    config: &MitigationConfiguration,
    warnings: &mut Vec<String>,
) {
    let mut overridden: HashMap<&str, usize> = HashMap::new();
    for (idx, ov) in config.overrides.iter().enumerate() {
        if let Some(first) = overridden.insert(ov.pattern_id.as_str(), idx) {
            warnings.push(format!(
                "overrides[{idx}] duplicates overrides[{first}] for '{}'; last applied wins",
                ov.pattern_id
            ));
        }
        if config.disabled_patterns.contains(&ov.pattern_id) {
            warnings.push(format!(
                "overrides[{idx}] targets disabled pattern '{}'",
                ov.pattern_id
            ));
        }
        let Some(slot) = catalog.by_id.get(&ov.pattern_id).copied() else {
            warnings.push(format!(
                "overrides[{idx}] references unknown pattern '{}'",
                ov.pattern_id
            ));
            continue;
        };
        let pattern = &mut catalog.patterns[slot].pattern;
        if let Some(confidence) = ov.confidence {
            if confidence > 0.0 && confidence <= 1.0 {
                pattern.confidence = confidence;
            } else {
                warnings.push(format!(
                    "overrides[{idx}] confidence {confidence} is outside (0, 1]; ignored"
                ));
            }
        }
        if let Some(reason) = &ov.deprecated {
            pattern.deprecated = Some(reason.clone());
        }
    }
}
