//! Static collector module configuration
//!
//! Loaded from TOML:
//!
//! ```toml
//! [[module]]
//! name = "claims"
//! priority = 1
//!
//! [[module.model]]
//! name = "CLAIM"
//! topic_code = "claims-sync"
//! depend_on = ["POLICY"]
//! parallel = true
//! tables = ["claim", "claim_line"]
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

fn default_parallel() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorModelConfig {
    pub name: String,
    pub topic_code: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    #[serde(default)]
    pub depend_on: Vec<String>,
    #[serde(default)]
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorModuleConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, rename = "model")]
    pub models: Vec<CollectorModelConfig>,
}

/// All configured modules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCatalog {
    #[serde(default, rename = "module")]
    pub modules: Vec<CollectorModuleConfig>,
}

impl ModuleCatalog {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let catalog: Self = toml::from_str(raw).context("Failed to parse module configuration")?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read module configuration {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid module configuration {}", path.display()))
    }

    pub fn module(&self, name: &str) -> Option<&CollectorModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn models(&self) -> impl Iterator<Item = &CollectorModelConfig> {
        self.modules.iter().flat_map(|m| m.models.iter())
    }

    pub fn model(&self, name: &str) -> Option<&CollectorModelConfig> {
        self.models().find(|m| m.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let mut module_names = HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                bail!("Module name cannot be empty");
            }
            if !module_names.insert(module.name.as_str()) {
                bail!("Duplicate module '{}'", module.name);
            }
        }

        let mut models: HashMap<&str, &CollectorModelConfig> = HashMap::new();
        for model in self.models() {
            if model.name.trim().is_empty() {
                bail!("Model name cannot be empty");
            }
            if models.insert(model.name.as_str(), model).is_some() {
                bail!("Duplicate model '{}'", model.name);
            }
            if model.topic_code.trim().is_empty() {
                bail!("Model '{}' has an empty topic_code", model.name);
            }
            if model.tables.is_empty() {
                bail!("Model '{}' declares no tables", model.name);
            }
        }

        for model in models.values() {
            for dep in &model.depend_on {
                if !models.contains_key(dep.as_str()) {
                    bail!("Model '{}' depends on unknown model '{}'", model.name, dep);
                }
            }
        }

        if let Some(cycle) = find_cycle(&models) {
            bail!("Model dependency cycle: {}", cycle.join(" -> "));
        }

        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

fn find_cycle(models: &HashMap<&str, &CollectorModelConfig>) -> Option<Vec<String>> {
    fn visit<'a>(
        name: &'a str,
        models: &HashMap<&'a str, &'a CollectorModelConfig>,
        marks: &mut HashMap<&'a str, Visit>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        match marks.get(name) {
            Some(Visit::Done) => return None,
            Some(Visit::InProgress) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(name.to_string());
                return Some(cycle);
            }
            None => {}
        }

        marks.insert(name, Visit::InProgress);
        path.push(name);
        if let Some(model) = models.get(name).copied() {
            for dep in &model.depend_on {
                if let Some(cycle) = visit(dep.as_str(), models, marks, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        marks.insert(name, Visit::Done);
        None
    }

    let mut names: Vec<&str> = models.keys().copied().collect();
    names.sort_unstable();

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    names
        .into_iter()
        .find_map(|name| visit(name, models, &mut marks, &mut path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CATALOG: &str = r#"
        [[module]]
        name = "policy"
        priority = 0

        [[module.model]]
        name = "POLICY"
        topic_code = "policy-sync"
        tables = ["policy"]

        [[module]]
        name = "claims"
        priority = 1

        [[module.model]]
        name = "CLAIM"
        topic_code = "claims-sync"
        depend_on = ["POLICY"]
        parallel = false
        tables = ["claim", "claim_line"]
    "#;

    #[test]
    fn test_parse_catalog() {
        let catalog = ModuleCatalog::from_toml_str(CATALOG).unwrap();
        assert_eq!(catalog.modules.len(), 2);

        let claim = catalog.model("CLAIM").unwrap();
        assert_eq!(claim.depend_on, vec!["POLICY".to_string()]);
        assert!(!claim.parallel);
        assert!(catalog.model("POLICY").unwrap().parallel);
        assert_eq!(catalog.module("claims").unwrap().priority, 1);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let raw = CATALOG.replace("depend_on = [\"POLICY\"]", "depend_on = [\"CUSTOMER\"]");
        let err = ModuleCatalog::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("unknown model 'CUSTOMER'"));
    }

    #[test]
    fn test_cycle_rejected() {
        let raw = CATALOG.replace(
            "topic_code = \"policy-sync\"",
            "topic_code = \"policy-sync\"\n        depend_on = [\"CLAIM\"]",
        );
        let err = ModuleCatalog::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{}", err);
    }

    #[test]
    fn test_duplicate_model_rejected() {
        let raw = CATALOG.replace("name = \"CLAIM\"", "name = \"POLICY\"");
        assert!(ModuleCatalog::from_toml_str(&raw).is_err());
    }

    #[test]
    fn test_model_without_tables_rejected() {
        let raw = CATALOG.replace("tables = [\"policy\"]", "tables = []");
        let err = ModuleCatalog::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("declares no tables"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();

        let catalog = ModuleCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.models().count(), 2);
    }
}
