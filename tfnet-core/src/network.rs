//! TF-gene edge weights: for every gene, the TFs whose binding sites are
//! enriched among the regulatory regions interacting with the gene.
use anyhow::{bail, Context, Result};
use indexmap::{IndexMap, IndexSet};
use indicatif::{style::ProgressStyle, ParallelProgressIterator};
use log::info;
use rayon::prelude::*;
use statrs::stats_tests::{fishers_exact, Alternative};
use std::collections::HashMap;
use std::io::{BufRead, Write};

use crate::tfbs::TfbsMatrix;
use crate::utils::strip_version;

pub const NETWORK_OUTPUT: &str = "TFGeneNet.txt.gz";
const GENE_COLUMN: &str = "Ensembl ID";
const REGION_COLUMN: &str = "PeakID";

/// Region names are compared without a leading `chr`.
pub fn normalize_region(region: &str) -> String {
    region.strip_prefix("chr").unwrap_or(region).to_string()
}

/// Gene to regulatory region interactions, e.g. from the ABC model.
#[derive(Debug, Clone, Default)]
pub struct Interactions {
    genes: IndexMap<String, IndexSet<String>>,
    regions: IndexSet<String>,
}

impl Interactions {
    /// Read a tab-separated table with `Ensembl ID` and `PeakID` columns.
    /// Gene IDs lose their version, region names a leading `chr`.
    pub fn read<R: BufRead>(input: R) -> Result<Self> {
        let mut lines = input.lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => bail!("empty interaction file"),
        };
        let columns: Vec<&str> = header.trim_end().split('\t').collect();
        let position = |name: &str| columns.iter().position(|x| *x == name)
            .with_context(|| format!("column '{}' missing in interaction file", name));
        let (gene_i, region_i) = (position(GENE_COLUMN)?, position(REGION_COLUMN)?);

        let mut interactions = Self::default();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.trim_end_matches(['\n', '\r']).split('\t').collect();
            let (gene, region) = match (fields.get(gene_i), fields.get(region_i)) {
                (Some(g), Some(r)) => (*g, *r),
                _ => bail!("truncated row in interaction file: {}", line),
            };
            interactions.insert(strip_version(gene), &normalize_region(region));
        }
        Ok(interactions)
    }

    pub fn insert(&mut self, gene: &str, region: &str) {
        self.genes.entry(gene.to_string()).or_default().insert(region.to_string());
        self.regions.insert(region.to_string());
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }

    /// Number of distinct interacting regions.
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }
}

/// Which TFs bind each interacting region.
pub struct RegionBinding {
    /// Per interacting region, the indices of TFs with at least one site.
    region_tfs: HashMap<String, Vec<usize>>,
    /// Per TF, the number of interacting regions with at least one site.
    tf_num_regions: Vec<u64>,
    num_regions: u64,
}

impl RegionBinding {
    /// Regions of the matrix that do not interact with any gene are ignored.
    /// Interacting regions absent from the matrix have no bound TFs.
    pub fn new(matrix: &TfbsMatrix, interactions: &Interactions) -> Self {
        let mut tf_num_regions = vec![0; matrix.motifs().len()];
        let region_tfs: HashMap<String, Vec<usize>> = interactions.regions.iter().map(|region| {
            let tfs: Vec<usize> = matrix.get(region)
                .map(|counts| counts.iter().enumerate().filter(|(_, c)| **c > 0).map(|(i, _)| i).collect())
                .unwrap_or_default();
            tfs.iter().for_each(|i| tf_num_regions[*i] += 1);
            (region.clone(), tfs)
        }).collect();
        Self { region_tfs, tf_num_regions, num_regions: interactions.num_regions() as u64 }
    }

    pub fn tf_num_regions(&self) -> &[u64] {
        &self.tf_num_regions
    }

    /// Edge weight of every TF for a gene with the given regions. A TF bound
    /// in `a` of the `n` regions gets `a / n` if a one-sided Fisher's exact
    /// test on `[[a, n - a], [tf_regions - a, rest]]` gives a p-value of at
    /// most `pvalue_cutoff`, and 0 otherwise.
    pub fn gene_weights<'a, I>(&self, regions: I, pvalue_cutoff: f64) -> Result<Vec<f64>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut bound = vec![0u64; self.tf_num_regions.len()];
        let mut n = 0u64;
        for region in regions {
            n += 1;
            if let Some(tfs) = self.region_tfs.get(region) {
                tfs.iter().for_each(|i| bound[*i] += 1);
            }
        }

        bound.iter().zip(self.tf_num_regions.iter()).map(|(&a, &tf_num)| {
            if a == 0 {
                return Ok(0.0);
            }
            let b = n - a;
            let c = tf_num - a;
            let d = self.num_regions.saturating_sub(tf_num).saturating_sub(b);
            let p = fishers_exact(&[a, b, c, d], Alternative::Greater)
                .with_context(|| format!("invalid contingency table: {:?}", [a, b, c, d]))?;
            Ok(if p <= pvalue_cutoff { a as f64 / n as f64 } else { 0.0 })
        }).collect()
    }
}

/// Edge weights of one gene.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneEdges {
    pub gene: String,
    pub num_regions: usize,
    pub weights: Vec<f64>,
}

/// TF by gene weight matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct TfGeneNetwork {
    pub tfs: Vec<String>,
    pub genes: Vec<GeneEdges>,
}

impl TfGeneNetwork {
    /// Weights for all genes, computed on `cores` threads. Genes are sorted by ID.
    pub fn build(
        matrix: &TfbsMatrix,
        interactions: &Interactions,
        pvalue_cutoff: f64,
        cores: usize,
    ) -> Result<Self> {
        if matrix.is_empty() {
            bail!("No FIMO hits found in the regions");
        }
        let binding = RegionBinding::new(matrix, interactions);
        let mut genes: Vec<(&String, &IndexSet<String>)> = interactions.genes.iter().collect();
        genes.sort_by(|a, b| a.0.cmp(b.0));

        info!("Computing TF weights for {} genes", genes.len());
        let pool = rayon::ThreadPoolBuilder::new().num_threads(cores.max(1)).build()?;
        let style = ProgressStyle::with_template(
            "[{elapsed}] {bar:40.cyan/blue} {pos:>7}/{len:7} (eta: {eta})"
        )?;
        let genes = pool.install(|| genes.into_par_iter().progress_with_style(style).map(|(gene, regions)| {
            Ok(GeneEdges {
                gene: gene.clone(),
                num_regions: regions.len(),
                weights: binding.gene_weights(regions, pvalue_cutoff)?,
            })
        }).collect::<Result<Vec<_>>>())?;

        Ok(Self { tfs: matrix.motifs().to_vec(), genes })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<()> {
        write!(writer, "{}\t#CREs", GENE_COLUMN)?;
        self.tfs.iter().try_for_each(|tf| write!(writer, "\t{}", tf))?;
        writeln!(writer)?;
        for edges in &self.genes {
            write!(writer, "{}\t{}", edges.gene, edges.num_regions)?;
            for w in &edges.weights {
                if *w == 0.0 {
                    write!(writer, "\t0")?;
                } else {
                    write!(writer, "\t{:?}", w)?;
                }
            }
            writeln!(writer)?;
        }
        Ok(())
    }
}
