use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::identifiers::Species;

/// Settings of a network run, read from a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Directory receiving all outputs.
    pub output_path: PathBuf,
    /// Motifs in MEME format.
    pub pwm_file: PathBuf,
    /// GENCODE-style annotation, optionally gzipped.
    pub gtf_file: PathBuf,
    /// Open chromatin regions in BED format.
    pub peak_file: PathBuf,
    pub fasta_file: PathBuf,
    #[serde(default = "default_fimo")]
    pub fimo_src: PathBuf,
    /// Table of gene to region interactions.
    pub abc_interactions: PathBuf,
    #[serde(default = "default_cores")]
    pub cores: usize,
    /// Only keep TFs whose promoter overlaps an open region.
    #[serde(default, deserialize_with = "bool_or_string")]
    pub open_tfs_only: bool,
    #[serde(default = "default_species", deserialize_with = "species_from_str", serialize_with = "species_to_str")]
    pub species: Species,
    #[serde(default = "default_samtools")]
    pub samtools_src: PathBuf,
    #[serde(default = "default_pvalue_cutoff")]
    pub pvalue_cutoff: f64,
    #[serde(default = "default_promoter_extend")]
    pub promoter_extend: u64,
    #[serde(default, deserialize_with = "bool_or_string")]
    pub write_sequence: bool,
}

fn default_fimo() -> PathBuf { PathBuf::from("fimo") }
fn default_samtools() -> PathBuf { PathBuf::from("samtools") }
fn default_cores() -> usize { 1 }
fn default_species() -> Species { Species::Human }
fn default_pvalue_cutoff() -> f64 { 0.05 }
fn default_promoter_extend() -> u64 { 200 }

/// Accepts `true`, `false` or their string forms in any case.
fn bool_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(de::Error::custom(format!("expecting true or false, found: {}", s))),
        },
        other => Err(de::Error::custom(format!("expecting true or false, found: {}", other))),
    }
}

fn species_from_str<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Species, D::Error> {
    String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
}

fn species_to_str<S: serde::Serializer>(species: &Species, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(species.as_str())
}

impl NetworkConfig {
    /// Read the configuration and keep the raw document, which is copied
    /// into the output directory as given.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<(Self, Map<String, Value>)> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read config: {}", path.as_ref().display()))?;
        Self::from_json(&content)
            .with_context(|| format!("invalid config: {}", path.as_ref().display()))
    }

    pub fn from_json(content: &str) -> Result<(Self, Map<String, Value>)> {
        let raw: Map<String, Value> = serde_json::from_str(content)?;
        let config = serde_json::from_value(Value::Object(raw.clone()))?;
        Ok((config, raw))
    }
}

/// Write the raw configuration with an added `start time` (local time,
/// `YYYY-MM-DD HH:MM:SS.ffffff`) to `<output_path>/<file_name>`.
pub fn write_config_copy(
    raw: &Map<String, Value>,
    output_path: &Path,
    file_name: &str,
) -> Result<PathBuf> {
    let mut raw = raw.clone();
    let start = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
    raw.insert("start time".to_string(), Value::String(start));
    let out = output_path.join(file_name);
    std::fs::write(&out, serde_json::to_string_pretty(&raw)?)
        .with_context(|| format!("cannot write config copy: {}", out.display()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "output_path": "out",
        "pwm_file": "motifs.meme",
        "gtf_file": "gencode.gtf.gz",
        "peak_file": "peaks.bed",
        "fasta_file": "genome.fa",
        "abc_interactions": "abc.txt",
        "cores": 4,
        "open_tfs_only": "True"
    }"#;

    #[test]
    fn test_defaults() {
        let (config, raw) = NetworkConfig::from_json(CONFIG).unwrap();
        assert_eq!(config.cores, 4);
        assert!(config.open_tfs_only);
        assert!(!config.write_sequence);
        assert_eq!(config.fimo_src, PathBuf::from("fimo"));
        assert_eq!(config.species, Species::Human);
        assert_eq!(config.pvalue_cutoff, 0.05);
        assert_eq!(config.promoter_extend, 200);
        assert_eq!(raw.len(), 8);
    }

    #[test]
    fn test_invalid() {
        assert!(NetworkConfig::from_json(r#"{"output_path": "out"}"#).is_err());
        let bad = CONFIG.replace("\"True\"", "\"maybe\"");
        assert!(NetworkConfig::from_json(&bad).is_err());
        let bad = CONFIG.replace("\"cores\": 4", "\"species\": \"dog\"");
        assert!(NetworkConfig::from_json(&bad).is_err());
    }

    #[test]
    fn test_config_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (_, raw) = NetworkConfig::from_json(CONFIG).unwrap();
        let out = write_config_copy(&raw, dir.path(), "run.json").unwrap();
        let copy: Map<String, Value> = serde_json::from_str(&std::fs::read_to_string(out).unwrap()).unwrap();
        let start = copy["start time"].as_str().unwrap();
        assert!(chrono::NaiveDateTime::parse_from_str(start, "%Y-%m-%d %H:%M:%S%.6f").is_ok());
        assert_eq!(start.len(), 26);
        assert_eq!(copy["cores"], 4);
    }
}
