//! Motif hits reported by FIMO and the region-by-motif binding site counts
//! derived from them.
use anyhow::{bail, ensure, Context, Result};
use bed_utils::bed::{merge_sorted_bed_with, GenomicRange};
use indexmap::IndexMap;
use itertools::Itertools;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, Write};

/// A single motif hit in a region, with FIMO's coordinates.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct FimoHit {
    pub motif: String,
    pub region: String,
    pub strand: String,
    pub start: u64,
    pub end: u64,
}

/// The region a FIMO sequence name refers to. Names are either
/// `region::suffix` or `::region`, depending on how the sequences were written.
pub fn sequence_region(sequence_name: &str) -> &str {
    match sequence_name.strip_prefix("::") {
        Some(rest) => rest.split("::").next().unwrap_or(rest),
        None => sequence_name.split("::").next().unwrap_or(sequence_name),
    }
}

/// Read FIMO's tab-separated output. Columns are located by the header.
/// If the output includes matched sequences (`write_sequence`), rows whose
/// number of fields differs from the header are skipped.
pub fn read_fimo_hits<R: BufRead>(input: R, write_sequence: bool) -> Result<Vec<FimoHit>> {
    let mut lines = input.lines();
    let header = match lines.next() {
        Some(line) => line?,
        None => return Ok(Vec::new()),
    };
    let header: HashMap<&str, usize> = header.trim_start_matches('#').trim()
        .split('\t').enumerate().map(|(i, x)| (x.trim(), i)).collect();
    let column = |name: &str| header.get(name).copied()
        .with_context(|| format!("column '{}' missing in FIMO output", name));
    let (motif_i, seq_i, start_i, stop_i, strand_i) = (
        column("motif_id")?, column("sequence_name")?, column("start")?, column("stop")?, column("strand")?,
    );

    let mut hits = Vec::new();
    for line in lines {
        let line = line?;
        let line = line.trim_end_matches(['\n', '\r']);
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if write_sequence && fields.len() != header.len() {
            debug!("skipping FIMO row with {} fields", fields.len());
            continue;
        }
        let field = |i: usize| fields.get(i).copied()
            .with_context(|| format!("truncated FIMO row: {}", line));
        hits.push(FimoHit {
            motif: field(motif_i)?.to_string(),
            region: sequence_region(field(seq_i)?).to_string(),
            strand: field(strand_i)?.to_string(),
            start: field(start_i)?.parse().with_context(|| format!("invalid start in: {}", line))?,
            end: field(stop_i)?.parse().with_context(|| format!("invalid stop in: {}", line))?,
        });
    }
    Ok(hits)
}

/// Binding site counts: one row per region, one column per motif.
#[derive(Debug, Clone, PartialEq)]
pub struct TfbsMatrix {
    motifs: Vec<String>,
    regions: IndexMap<String, Vec<u32>>,
}

impl TfbsMatrix {
    pub fn new(motifs: Vec<String>) -> Self {
        Self { motifs, regions: IndexMap::new() }
    }

    /// Count binding sites per region and motif. Overlapping hits of the
    /// same motif on the same strand of a region count as one site.
    /// Columns are `motifs` in the given order; rows are the regions with at
    /// least one hit, in order of first appearance.
    pub fn from_hits(hits: Vec<FimoHit>, motifs: Vec<String>) -> Self {
        let (matrix, unknown) = Self::count_sites(hits, motifs);
        unknown.iter().for_each(|m| warn!("motif {} is not in the motif file", m));
        matrix
    }

    /// The matrix and the motifs of `hits` that are not among its columns.
    fn count_sites(mut hits: Vec<FimoHit>, motifs: Vec<String>) -> (Self, BTreeSet<String>) {
        let mut matrix = Self::new(motifs);
        let n = matrix.motifs.len();
        for hit in &hits {
            if !matrix.regions.contains_key(&hit.region) {
                matrix.regions.insert(hit.region.clone(), vec![0; n]);
            }
        }
        let column: HashMap<String, usize> = matrix.motifs.iter().enumerate()
            .map(|(i, m)| (m.clone(), i)).collect();

        hits.sort();
        let mut unknown = BTreeSet::new();
        let groups = hits.into_iter()
            .group_by(|x| (x.motif.clone(), x.region.clone(), x.strand.clone()));
        for ((motif, region, _), group) in &groups {
            let sites = merge_sorted_bed_with(
                group.map(|x| GenomicRange::new(x.region, x.start, x.end)),
                |beds: Vec<GenomicRange>| beds.len(),
            ).count() as u32;
            match column.get(&motif) {
                Some(j) => if let Some(row) = matrix.regions.get_mut(&region) {
                    row[*j] += sites;
                },
                None => {
                    unknown.insert(motif);
                }
            }
        }
        (matrix, unknown)
    }

    pub fn motifs(&self) -> &[String] {
        &self.motifs
    }

    pub fn regions(&self) -> impl Iterator<Item = (&String, &Vec<u32>)> {
        self.regions.iter()
    }

    pub fn get(&self, region: &str) -> Option<&Vec<u32>> {
        self.regions.get(region)
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Rename regions; rows mapped to the same name are summed.
    pub fn map_regions<F: Fn(&str) -> String>(self, f: F) -> Self {
        let n = self.motifs.len();
        let mut regions: IndexMap<String, Vec<u32>> = IndexMap::new();
        for (region, counts) in self.regions {
            let row = regions.entry(f(&region)).or_insert_with(|| vec![0; n]);
            row.iter_mut().zip(counts).for_each(|(a, b)| *a += b);
        }
        Self { motifs: self.motifs, regions }
    }

    pub fn read<R: BufRead>(input: R) -> Result<Self> {
        let mut lines = input.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => bail!("empty TFBS matrix"),
        };
        let mut columns = header.trim_end().split('\t');
        ensure!(columns.next() == Some("region"), "TFBS matrix must start with a 'region' column");
        let mut matrix = Self::new(columns.map(str::to_string).collect());
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.trim_end().split('\t');
            let region = fields.next().unwrap_or_default().to_string();
            let counts = fields
                .map(|x| x.parse::<u32>().with_context(|| format!("invalid count in row: {}", line)))
                .collect::<Result<Vec<_>>>()?;
            ensure!(counts.len() == matrix.motifs.len(), "wrong number of columns in row: {}", line);
            matrix.regions.insert(region, counts);
        }
        Ok(matrix)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        write!(writer, "region")?;
        self.motifs.iter().try_for_each(|m| write!(writer, "\t{}", m))?;
        writeln!(writer)?;
        for (region, counts) in &self.regions {
            write!(writer, "{}", region)?;
            counts.iter().try_for_each(|c| write!(writer, "\t{}", c))?;
            writeln!(writer)?;
        }
        Ok(())
    }
}
