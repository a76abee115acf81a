//! Motif files in MEME format: motif names, constituent monomers, subsetting
//! and background frequencies fitted to a set of sequences.
use anyhow::{Context, Result};
use indexmap::{IndexMap, IndexSet};
use log::{info, warn};
use std::collections::HashSet;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::identifiers::{match_gene_identifiers, GeneQuery, GeneQueryService, Species};
use crate::utils::{open_file_for_read, open_file_for_write};

const MOTIF_KEYWORD: &str = "MOTIF";
const BACKGROUND_KEYWORD: &str = "Background letter frequencies";

/// Background frequencies of A, C, G and T.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundProb(pub [f64; 4]);

impl Default for BackgroundProb {
    fn default() -> Self {
        BackgroundProb([0.25, 0.25, 0.25, 0.25])
    }
}

impl BackgroundProb {
    /// Strand-symmetric frequencies from base counts `[a, c, g, t]` and the
    /// total number of non-N bases, rounded to 5 decimals.
    pub fn from_counts(counts: [u64; 4], total: u64) -> Self {
        let round = |x: f64| (x * 1e5).round() / 1e5;
        let total = total.max(1) as f64;
        let at = round((counts[0] + counts[3]) as f64 / total / 2.0);
        let cg = round((counts[1] + counts[2]) as f64 / total / 2.0);
        BackgroundProb([at, cg, cg, at])
    }
}

impl fmt::Display for BackgroundProb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:\nA {} C {} G {} T {}", BACKGROUND_KEYWORD, self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// A single motif, kept verbatim from the `MOTIF` line to the next motif.
#[derive(Debug, Clone, PartialEq)]
pub struct MotifBlock {
    pub name: String,
    text: String,
}

impl MotifBlock {
    /// Name without `(version)` suffixes, e.g. `BHLHA15(MA0607.2)` becomes `BHLHA15`.
    pub fn unversioned_name(&self) -> &str {
        self.name.split('(').next().unwrap_or(&self.name)
    }

    /// Constituent monomers without versions: `FOXJ2::ELF1` gives `[FOXJ2, ELF1]`.
    pub fn monomers(&self) -> Vec<&str> {
        self.name.split("::").map(|x| x.split('(').next().unwrap_or(x)).collect()
    }
}

/// A MEME motif file: the header lines and the motif blocks in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct Meme {
    header: String,
    motifs: Vec<MotifBlock>,
}

impl FromStr for Meme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut header = String::new();
        let mut motifs: Vec<MotifBlock> = Vec::new();
        for line in s.split_inclusive('\n') {
            if let Some(rest) = line.strip_prefix(MOTIF_KEYWORD).filter(|x| x.starts_with(char::is_whitespace)) {
                let name = rest.split_whitespace().next()
                    .with_context(|| format!("motif without name: {}", line.trim_end()))?;
                motifs.push(MotifBlock { name: name.to_string(), text: String::new() });
            }
            match motifs.last_mut() {
                Some(block) => block.text.push_str(line),
                None => header.push_str(line),
            }
        }
        Ok(Meme { header, motifs })
    }
}

impl fmt::Display for Meme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header)?;
        self.motifs.iter().try_for_each(|m| f.write_str(&m.text))
    }
}

impl Meme {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut content = String::new();
        open_file_for_read(&path)?.read_to_string(&mut content)
            .with_context(|| format!("cannot read motif file: {}", path.as_ref().display()))?;
        content.parse()
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = open_file_for_write(&path, None, None)?;
        write!(writer, "{}", self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn motifs(&self) -> &[MotifBlock] {
        &self.motifs
    }

    /// Motif names in file order.
    pub fn motif_names(&self) -> Vec<&str> {
        self.motifs.iter().map(|x| x.name.as_str()).collect()
    }

    /// Motif name to its monomers, and the set of all monomers.
    pub fn monomer_map(&self) -> (IndexMap<String, Vec<String>>, IndexSet<String>) {
        let map: IndexMap<String, Vec<String>> = self.motifs.iter()
            .map(|m| (m.name.clone(), m.monomers().into_iter().map(str::to_string).collect()))
            .collect();
        let all = map.values().flatten().cloned().collect();
        (map, all)
    }

    /// Keep the header and the selected motifs. Without `exact_match` the
    /// names are compared without `(version)` suffixes. With `include_dimers`
    /// a motif is also kept if any of its `::` parts is selected.
    pub fn subset(&self, names: &HashSet<String>, include_dimers: bool, exact_match: bool) -> Meme {
        let motifs = self.motifs.iter().filter(|m| {
            let name = if exact_match { m.name.as_str() } else { m.unversioned_name() };
            names.contains(name) || (include_dimers && name.split("::").any(|x| names.contains(x)))
        }).cloned().collect();
        Meme { header: self.header.clone(), motifs }
    }

    /// Replace the background frequencies in the header, or add them at its
    /// end if there are none.
    pub fn with_background(&self, background: &BackgroundProb) -> Meme {
        let trailing = self.header.len() - self.header.trim_end_matches('\n').len();
        let body = self.header.trim_end_matches('\n');
        let mut paragraphs: Vec<String> = if body.is_empty() {
            Vec::new()
        } else {
            body.split("\n\n").map(str::to_string).collect()
        };
        let new_block = background.to_string();
        match paragraphs.iter().position(|x| x.starts_with(BACKGROUND_KEYWORD)) {
            Some(i) => paragraphs[i] = new_block,
            None => paragraphs.push(new_block),
        }
        let mut header = paragraphs.join("\n\n");
        header.push_str(&"\n".repeat(trailing.max(2)));
        Meme { header, motifs: self.motifs.clone() }
    }
}

/// Write a MEME file with only the motifs in `motif_names`; see [`Meme::subset`].
pub fn subset_meme<P: AsRef<Path>, Q: AsRef<Path>>(
    meme_file: P,
    motif_names: &HashSet<String>,
    out_file: Q,
    include_dimers: bool,
    exact_match: bool,
) -> Result<()> {
    let meme = Meme::read(&meme_file)?;
    let subset = meme.subset(motif_names, include_dimers, exact_match);
    info!("Kept {} of {} motifs", subset.motifs().len(), meme.motifs().len());
    subset.write(out_file)
}

/// Count A, C, G, T and all non-N bases in a FASTA file, case-insensitive.
pub fn count_bases<P: AsRef<Path>>(fasta: P) -> Result<([u64; 4], u64)> {
    let reader = bio::io::fasta::Reader::new(open_file_for_read(&fasta)?);
    let mut counts = [0u64; 4];
    let mut total = 0u64;
    for record in reader.records() {
        let record = record.with_context(|| format!("invalid FASTA: {}", fasta.as_ref().display()))?;
        for base in record.seq() {
            match base.to_ascii_lowercase() {
                b'a' => counts[0] += 1,
                b'c' => counts[1] += 1,
                b'g' => counts[2] += 1,
                b't' => counts[3] += 1,
                b'n' => continue,
                x if x.is_ascii_whitespace() => continue,
                _ => {}
            }
            total += 1;
        }
    }
    Ok((counts, total))
}

/// Write `<out_dir>/<meme stem>_bg.txt`, a copy of the motif file whose
/// background frequencies match the base content of `sequence_file`.
pub fn fit_background<P, Q, R>(meme_file: P, sequence_file: Q, out_dir: R) -> Result<PathBuf>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    let (counts, total) = count_bases(&sequence_file)?;
    let background = BackgroundProb::from_counts(counts, total);
    let stem = meme_file.as_ref().file_name()
        .and_then(|x| x.to_str())
        .and_then(|x| x.split('.').next())
        .unwrap_or("motifs");
    let out = out_dir.as_ref().join(format!("{}_bg.txt", stem));
    Meme::read(&meme_file)?.with_background(&background).write(&out)?;
    info!("New meme file with matching background at {}", out.display());
    Ok(out)
}

/// Motifs mapped to the Ensembl IDs of their monomers.
pub struct MotifIdMap {
    /// Motif name to one Ensembl ID per monomer.
    pub ids: IndexMap<String, Vec<String>>,
    /// All monomers without versions.
    pub monomers: IndexSet<String>,
    /// Motifs with at least one unmappable monomer.
    pub misses: Vec<String>,
}

/// Resolve the monomers of every motif to Ensembl IDs by symbol, first in the
/// GTF file and then through `service`. Motifs with an unmappable monomer are
/// reported as misses and left out.
pub fn motif_id_map<S: GeneQueryService + ?Sized>(
    meme: &Meme,
    gtf_file: Option<&Path>,
    service: &S,
    species: Species,
) -> Result<MotifIdMap> {
    let (monomer_map, monomers) = meme.monomer_map();
    let names: Vec<String> = monomers.iter().cloned().collect();
    let query = GeneQuery::new(species, "symbol", "ensembl");
    let (mapped, _) = match_gene_identifiers(&names, gtf_file, &query, service)?;

    let mut ids = IndexMap::new();
    let mut misses = Vec::new();
    for (motif, subs) in monomer_map {
        let resolved: Vec<Option<&String>> = subs.iter()
            .map(|sub| mapped.get(sub).and_then(|x| x.get("ensembl")))
            .collect();
        subs.iter().zip(resolved.iter())
            .filter(|(_, id)| id.is_none())
            .for_each(|(sub, _)| warn!("{} name not mappable", sub));
        match resolved.into_iter().collect::<Option<Vec<_>>>() {
            Some(found) => { ids.insert(motif, found.into_iter().cloned().collect()); },
            None => misses.push(motif),
        }
    }
    Ok(MotifIdMap { ids, monomers, misses })
}
