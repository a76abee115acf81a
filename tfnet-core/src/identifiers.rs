//! Mapping of gene identifiers (symbols, Ensembl IDs, ...) to each other, first
//! through a GTF annotation and then through the mygene.info batch query service.
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use log::{debug, info};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::genome::{read_gene_tss, TssType};
use crate::utils::open_file_for_read;

/// Maximal number of identifiers per request accepted by mygene.info.
pub const MYGENE_CHUNK_SIZE: usize = 1000;
pub const MYGENE_URL: &str = "https://mygene.info/v3/query";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Species {
    Human,
    Mouse,
    Rat,
    Fruitfly,
    Nematode,
    Zebrafish,
    ThaleCress,
    Frog,
    Pig,
}

impl Species {
    pub fn as_str(&self) -> &'static str {
        match self {
            Species::Human => "human",
            Species::Mouse => "mouse",
            Species::Rat => "rat",
            Species::Fruitfly => "fruitfly",
            Species::Nematode => "nematode",
            Species::Zebrafish => "zebrafish",
            Species::ThaleCress => "thale-cress",
            Species::Frog => "frog",
            Species::Pig => "pig",
        }
    }
}

impl FromStr for Species {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Species::Human),
            "mouse" => Ok(Species::Mouse),
            "rat" => Ok(Species::Rat),
            "fruitfly" => Ok(Species::Fruitfly),
            "nematode" => Ok(Species::Nematode),
            "zebrafish" => Ok(Species::Zebrafish),
            "thale-cress" => Ok(Species::ThaleCress),
            "frog" => Ok(Species::Frog),
            "pig" => Ok(Species::Pig),
            _ => Err(format!(
                "species not available with name for mygene.info: {}, available are human, mouse, \
                rat, fruitfly, nematode, zebrafish, thale-cress, frog, pig", s
            )),
        }
    }
}

/// Parameters of a batch query.
#[derive(Debug, Clone)]
pub struct GeneQuery {
    pub species: Species,
    /// Where the service searches for the identifiers, e.g. `symbol,alias`.
    pub scopes: String,
    /// Comma-separated fields to report, e.g. `ensembl,symbol`.
    pub fields: String,
    /// Only report hits with an Ensembl gene ID.
    pub ensembl_only: bool,
}

impl GeneQuery {
    pub fn new(species: Species, scopes: &str, fields: &str) -> Self {
        Self { species, scopes: scopes.to_string(), fields: fields.to_string(), ensembl_only: false }
    }

    fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.split(',').map(str::trim).filter(|x| !x.is_empty())
    }
}

/// A remote service resolving a batch of identifiers. Each returned entry is
/// a JSON object with a `query` key and the found fields.
pub trait GeneQueryService {
    fn query(&self, identifiers: &[String], query: &GeneQuery) -> Result<Vec<Value>>;
}

/// Client of the mygene.info batch query endpoint.
pub struct MyGeneClient {
    client: reqwest::blocking::Client,
    url: String,
}

impl MyGeneClient {
    pub fn new() -> Result<Self> {
        Self::with_url(MYGENE_URL)
    }

    pub fn with_url(url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("could not build mygene.info client")?;
        Ok(Self { client, url: url.to_string() })
    }
}

impl GeneQueryService for MyGeneClient {
    fn query(&self, identifiers: &[String], query: &GeneQuery) -> Result<Vec<Value>> {
        let form = [
            ("q", identifiers.join(" ")),
            ("species", query.species.as_str().to_string()),
            ("scopes", query.scopes.clone()),
            ("fields", query.fields.clone()),
            ("ensemblonly", query.ensembl_only.to_string()),
        ];
        let response = self.client.post(&self.url)
            .form(&form[..])
            .send()
            .with_context(|| format!("request to {} failed", self.url))?
            .error_for_status()?;
        let value: Value = response.json().context("mygene.info returned invalid JSON")?;
        match value {
            Value::Array(entries) => Ok(entries),
            other => bail!("unexpected response from {}: {}", self.url, other),
        }
    }
}

/// Identifier to the found fields, e.g. `{"ensembl": "ENSG...", "symbol": "FOS"}`.
pub type MappedIdentifiers = IndexMap<String, HashMap<String, String>>;

/// Map identifiers, first through the `gene` records of a GTF file (only if
/// `ensembl` or `symbol` is requested), then through the remote service in
/// chunks of [`MYGENE_CHUNK_SIZE`]. Returns the mapped identifiers and those
/// that could not be mapped, the latter in input order.
pub fn match_gene_identifiers<S: GeneQueryService + ?Sized>(
    identifiers: &[String],
    gtf_file: Option<&Path>,
    query: &GeneQuery,
    service: &S,
) -> Result<(MappedIdentifiers, Vec<String>)> {
    let mut mapped = MappedIdentifiers::new();

    let use_gtf = query.fields().any(|f| f.contains("ensembl") || f.contains("symbol"));
    if let (Some(gtf_file), true) = (gtf_file, use_gtf) {
        info!("Checking gtf-file for matches");
        let queried: HashSet<String> = identifiers.iter().cloned().collect();
        let genes = read_gene_tss(open_file_for_read(gtf_file)?, TssType::FivePrime, Some(&queried))
            .with_context(|| format!("cannot read annotation: {}", gtf_file.display()))?;
        for (gene_id, gene) in genes {
            let key = if queried.contains(&gene.name) { gene.name.clone() } else { gene_id.clone() };
            let fields = HashMap::from([
                ("ensembl".to_string(), gene_id),
                ("symbol".to_string(), gene.name),
            ]);
            mapped.insert(key, fields);
        }
    }

    let gtf_missed: Vec<String> = identifiers.iter()
        .filter(|x| !mapped.contains_key(x.as_str()))
        .cloned()
        .collect();

    if !gtf_missed.is_empty() {
        info!("Querying mygene for names: {}", gtf_missed.len());
        let query_time = Instant::now();
        for chunk in gtf_missed.chunks(MYGENE_CHUNK_SIZE) {
            let entries = service.query(chunk, query)?;
            // Trailing entries that are not objects carry no hits.
            for entry in entries.iter().filter_map(Value::as_object).take(chunk.len()) {
                add_remote_hit(&mut mapped, entry, query);
            }
        }
        info!("Batch query complete: {:.2} seconds", query_time.elapsed().as_secs_f64());
    }

    let missed: Vec<String> = identifiers.iter()
        .filter(|x| !mapped.contains_key(x.as_str()))
        .cloned()
        .collect();
    info!("Non-matchable names: {}", missed.len());
    Ok((mapped, missed))
}

fn add_remote_hit(mapped: &mut MappedIdentifiers, entry: &serde_json::Map<String, Value>, query: &GeneQuery) {
    let Some(name) = entry.get("query").and_then(Value::as_str) else { return };
    if entry.get("notfound").and_then(Value::as_bool).unwrap_or(false) {
        debug!("not found: {}", name);
        return;
    }
    if query.ensembl_only && !entry.contains_key("ensembl") {
        return;
    }
    for field in query.fields() {
        let value = if field == "ensembl" || field == "ensembl.gene" {
            entry.get("ensembl").and_then(ensembl_gene)
        } else {
            entry.get(field).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        };
        if let Some(value) = value {
            mapped.entry(name.to_string()).or_default().insert(field.to_string(), value);
        }
    }
}

/// The Ensembl gene ID of an `ensembl` entry; only the first of several hits is kept.
fn ensembl_gene(value: &Value) -> Option<String> {
    let value = match value {
        Value::Array(hits) => hits.first()?,
        other => other,
    };
    value.get("gene").and_then(Value::as_str).map(str::to_string)
}
