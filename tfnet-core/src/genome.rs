//! Gene annotation: transcription start sites from GENCODE-style GTF files
//! and the promoter windows placed around them.
use anyhow::{Context, Result};
use bed_utils::bed::{
    merge_sorted_bed_with, tree::BedTree, BEDLike, GenomicRange, OptionalFields, Strand, BED,
};
use indexmap::map::IndexMap;
use itertools::Itertools;
use noodles::gtf;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{BufRead, Write};
use std::path::Path;
use std::str::FromStr;

use crate::bed::intersect;
use crate::utils::{open_file_for_read, strip_version};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChromSizes(IndexMap<String, u64>);

impl ChromSizes {
    pub fn total_size(&self) -> u64 {
        self.0.iter().map(|x| x.1).sum()
    }

    pub fn get(&self, chrom: &str) -> Option<u64> {
        self.0.get(chrom).copied()
    }

    /// Read sequence lengths from the `.fai` index that accompanies a FASTA file.
    pub fn from_fasta_index<P: AsRef<Path>>(fasta: P) -> Result<Self> {
        let index = bio::io::fasta::Index::with_fasta_file(&fasta)
            .with_context(|| format!("cannot read index of: {}", fasta.as_ref().display()))?;
        Ok(index.sequences().into_iter().map(|s| (s.name, s.len)).collect())
    }
}

impl<S> FromIterator<(S, u64)> for ChromSizes
where
    S: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (S, u64)>>(iter: T) -> Self {
        ChromSizes(iter.into_iter().map(|(s, l)| (s.into(), l)).collect())
    }
}

impl<'a> IntoIterator for &'a ChromSizes {
    type Item = (&'a String, &'a u64);
    type IntoIter = indexmap::map::Iter<'a, String, u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Which TSS to report per gene.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TssType {
    /// The most 5' TSS of the gene record.
    FivePrime,
    /// All unique TSS of the gene's transcripts.
    All,
}

impl TssType {
    fn feature_type(&self) -> &'static str {
        match self {
            TssType::FivePrime => "gene",
            TssType::All => "transcript",
        }
    }
}

impl FromStr for TssType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "5" => Ok(TssType::FivePrime),
            "all" => Ok(TssType::All),
            _ => Err(format!("unsupported TSS type: {}, expecting '5' or 'all'", s)),
        }
    }
}

/// TSS positions are 1-based, as in the GTF file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GeneTss {
    pub chrom: String,
    pub name: String,
    pub strand: Strand,
    pub tss: BTreeSet<u64>,
    pub num_transcripts: usize,
}

/// Collect TSS per gene ID (version removed). Genes with a `_PAR_Y` ID are
/// skipped. If `gene_set` is given, only genes whose ID or name is in the set
/// are reported; versions are removed from the set entries as well.
pub fn read_gene_tss<R: BufRead>(
    input: R,
    tss_type: TssType,
    gene_set: Option<&HashSet<String>>,
) -> Result<IndexMap<String, GeneTss>> {
    let gene_set: Option<HashSet<&str>> = gene_set
        .map(|set| set.iter().map(|g| strip_version(g)).collect());
    let mut genes: IndexMap<String, GeneTss> = IndexMap::new();
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let line = gtf::Line::from_str(&line)
            .with_context(|| format!("failed to parse GTF line: {}", line))?;
        let record = match line {
            gtf::line::Line::Record(rec) => rec,
            _ => continue,
        };
        if record.ty() != tss_type.feature_type() {
            continue;
        }
        let attributes: HashMap<&str, &str> = record
            .attributes()
            .iter()
            .map(|x| (x.key(), x.value()))
            .collect();
        let raw_id = attributes.get("gene_id").copied().unwrap_or_default();
        if raw_id.ends_with("_PAR_Y") {
            continue;
        }
        let gene_id = strip_version(raw_id);
        let gene_name = attributes.get("gene_name").copied().unwrap_or_default();
        if let Some(set) = &gene_set {
            if !set.contains(gene_id) && !set.contains(gene_name) {
                continue;
            }
        }
        let strand = match record.strand() {
            Some(gtf::record::Strand::Forward) => Strand::Forward,
            Some(gtf::record::Strand::Reverse) => Strand::Reverse,
            None => {
                log::debug!("skipping record without strand: {}", gene_id);
                continue;
            }
        };
        let pos = match strand {
            Strand::Forward => usize::from(record.start()) as u64,
            Strand::Reverse => usize::from(record.end()) as u64,
        };

        let entry = genes.entry(gene_id.to_string()).or_insert_with(|| GeneTss {
            chrom: String::new(),
            name: String::new(),
            strand,
            tss: BTreeSet::new(),
            num_transcripts: 0,
        });
        entry.chrom = record.reference_sequence_name().to_string();
        entry.name = gene_name.to_string();
        entry.strand = strand;
        match tss_type {
            TssType::FivePrime => {
                let more_5prime = match (entry.tss.first(), strand) {
                    (None, _) => true,
                    (Some(cur), Strand::Forward) => pos < *cur,
                    (Some(cur), Strand::Reverse) => pos > *cur,
                };
                if more_5prime {
                    entry.tss = BTreeSet::from([pos]);
                }
            }
            TssType::All => {
                entry.tss.insert(pos);
                entry.num_transcripts += 1;
            }
        }
    }
    Ok(genes)
}

/// One window per TSS, `extend` bases on each side of it, named by the gene ID.
/// Windows are 0-based: `[tss - extend - 1, tss + extend)`, clipped at 0.
pub fn promoter_windows(genes: &IndexMap<String, GeneTss>, extend: u64) -> Vec<BED<6>> {
    genes.iter().flat_map(|(id, gene)| gene.tss.iter().map(move |tss| BED::new(
        gene.chrom.as_str(),
        tss.saturating_sub(extend + 1),
        tss + extend,
        Some(id.clone()),
        None,
        Some(gene.strand),
        OptionalFields::default(),
    ))).collect()
}

pub struct PromoterOptions {
    /// Number of bases added on each side of a TSS.
    pub extend: u64,
    pub tss_type: TssType,
    pub gene_set: Option<HashSet<String>>,
    /// Merge overlapping windows of the same gene.
    pub merge: bool,
    /// Keep only the parts of windows overlapping these regions.
    pub open_regions: Option<Vec<GenomicRange>>,
}

impl Default for PromoterOptions {
    fn default() -> Self {
        Self {
            extend: 200,
            tss_type: TssType::FivePrime,
            gene_set: None,
            merge: false,
            open_regions: None,
        }
    }
}

/// Promoter windows of all genes in a GTF file (optionally gzipped).
pub fn gene_promoters<P: AsRef<Path>>(gtf_file: P, options: &PromoterOptions) -> Result<Vec<BED<6>>> {
    let genes = read_gene_tss(
        open_file_for_read(&gtf_file)?,
        options.tss_type,
        options.gene_set.as_ref(),
    ).with_context(|| format!("cannot read annotation: {}", gtf_file.as_ref().display()))?;
    let mut promoters = promoter_windows(&genes, options.extend);

    if let Some(open_regions) = &options.open_regions {
        let tree: BedTree<()> = open_regions.iter().map(|x| (x.clone(), ())).collect();
        promoters = intersect(promoters, &tree).collect();
    }

    if options.merge {
        promoters = merge_by_gene(promoters);
    }
    Ok(promoters)
}

/// Merge overlapping windows that share a gene, sorted by gene.
/// Strand needs no handling as a gene lies on a single strand.
fn merge_by_gene(mut promoters: Vec<BED<6>>) -> Vec<BED<6>> {
    promoters.sort_by(|a, b| a.name().cmp(&b.name()).then(a.compare(b)));
    let groups = promoters.into_iter().group_by(|x| x.name().map(str::to_string));
    let merged: Vec<BED<6>> = groups.into_iter().flat_map(|(_, group)|
        merge_sorted_bed_with(group, |beds: Vec<BED<6>>| {
            let end = beds.iter().map(|x| x.end()).max()?;
            let mut first = beds.into_iter().next()?;
            first.set_end(end);
            Some(first)
        }).flatten().collect::<Vec<_>>()
    ).collect();
    merged
}

/// Genes having at least one window in `promoters`.
pub fn promoter_genes(promoters: &[BED<6>]) -> HashSet<String> {
    promoters.iter().filter_map(|x| x.name().map(str::to_string)).collect()
}

pub fn write_bed<W: Write, B: std::fmt::Display>(mut writer: W, records: &[B]) -> Result<()> {
    records.iter().try_for_each(|x| writeln!(writer, "{}", x))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gene_ids(genes: &IndexMap<String, GeneTss>) -> String {
        genes.keys().join(",")
    }

    const GTF: &str = "##description: test annotation
chr1\tHAVANA\tgene\t1000\t5000\t.\t+\t.\tgene_id \"ENSG01.3\"; gene_type \"protein_coding\"; gene_name \"AAA\";
chr1\tHAVANA\ttranscript\t1000\t5000\t.\t+\t.\tgene_id \"ENSG01.3\"; transcript_id \"ENST01.1\"; gene_name \"AAA\";
chr1\tHAVANA\ttranscript\t1100\t5000\t.\t+\t.\tgene_id \"ENSG01.3\"; transcript_id \"ENST02.1\"; gene_name \"AAA\";
chr1\tHAVANA\ttranscript\t1000\t4000\t.\t+\t.\tgene_id \"ENSG01.3\"; transcript_id \"ENST03.1\"; gene_name \"AAA\";
chr2\tHAVANA\tgene\t100\t9000\t.\t-\t.\tgene_id \"ENSG02.1\"; gene_type \"lncRNA\"; gene_name \"BBB\";
chr2\tHAVANA\ttranscript\t100\t9000\t.\t-\t.\tgene_id \"ENSG02.1\"; transcript_id \"ENST04.2\"; gene_name \"BBB\";
chrY\tHAVANA\tgene\t10\t90\t.\t+\t.\tgene_id \"ENSG03.1_PAR_Y\"; gene_type \"lncRNA\"; gene_name \"CCC\";
";

    #[test]
    fn test_quoted_attributes() {
        let gtf = "chr3\tHAVANA\tgene\t500\t900\t.\t-\t.\tgene_id \"ENSG04.2\"; gene_type \"lncRNA\"; gene_name \"My Gene\";\n";
        let genes = read_gene_tss(gtf.as_bytes(), TssType::FivePrime, None).unwrap();
        assert_eq!(genes["ENSG04"].name, "My Gene");
        assert_eq!(genes["ENSG04"].tss, BTreeSet::from([900]));

        let set: HashSet<String> = ["My Gene".to_string()].into();
        let genes = read_gene_tss(gtf.as_bytes(), TssType::FivePrime, Some(&set)).unwrap();
        assert_eq!(gene_ids(&genes), "ENSG04");
    }

    #[test]
    fn test_five_prime_tss() {
        let genes = read_gene_tss(GTF.as_bytes(), TssType::FivePrime, None).unwrap();
        assert_eq!(gene_ids(&genes), "ENSG01,ENSG02");
        assert_eq!(genes["ENSG01"].tss, BTreeSet::from([1000]));
        assert_eq!(genes["ENSG02"].tss, BTreeSet::from([9000]));
        assert_eq!(genes["ENSG02"].strand, Strand::Reverse);
        assert_eq!(genes["ENSG02"].name, "BBB");
        assert_eq!(genes["ENSG01"].num_transcripts, 0);
    }

    #[test]
    fn test_all_tss() {
        let genes = read_gene_tss(GTF.as_bytes(), TssType::All, None).unwrap();
        assert_eq!(genes["ENSG01"].tss, BTreeSet::from([1000, 1100]));
        assert_eq!(genes["ENSG01"].num_transcripts, 3);
        assert_eq!(genes["ENSG02"].num_transcripts, 1);
    }

    #[test]
    fn test_gene_set() {
        let set: HashSet<String> = ["BBB".to_string()].into();
        let genes = read_gene_tss(GTF.as_bytes(), TssType::FivePrime, Some(&set)).unwrap();
        assert_eq!(gene_ids(&genes), "ENSG02");

        let set: HashSet<String> = ["ENSG01.7".to_string()].into();
        let genes = read_gene_tss(GTF.as_bytes(), TssType::FivePrime, Some(&set)).unwrap();
        assert_eq!(gene_ids(&genes), "ENSG01");
    }

    #[test]
    fn test_promoter_windows() {
        let genes = read_gene_tss(GTF.as_bytes(), TssType::FivePrime, None).unwrap();
        let windows = promoter_windows(&genes, 200);
        assert_eq!(windows[0].to_string(), "chr1\t799\t1200\tENSG01\t.\t+");
        assert_eq!(windows[0].len(), 401);
        assert_eq!(windows[1].to_string(), "chr2\t8799\t9200\tENSG02\t.\t-");

        let windows = promoter_windows(&genes, 2000);
        assert_eq!(windows[0].start(), 0);
    }

    #[test]
    fn test_gene_promoters() {
        let dir = tempfile::tempdir().unwrap();
        let gtf = dir.path().join("anno.gtf");
        std::fs::write(&gtf, GTF).unwrap();

        let options = PromoterOptions { tss_type: TssType::All, merge: true, ..Default::default() };
        let promoters = gene_promoters(&gtf, &options).unwrap();
        let expected = vec![
            "chr1\t799\t1300\tENSG01\t.\t+",
            "chr2\t8799\t9200\tENSG02\t.\t-",
        ];
        assert_eq!(promoters.iter().map(|x| x.to_string()).collect::<Vec<_>>(), expected);

        let options = PromoterOptions {
            tss_type: TssType::All,
            merge: true,
            open_regions: Some(vec![GenomicRange::new("chr1", 1250, 1500)]),
            ..Default::default()
        };
        let promoters = gene_promoters(&gtf, &options).unwrap();
        assert_eq!(promoters.len(), 1);
        assert_eq!(promoters[0].to_string(), "chr1\t1250\t1300\tENSG01\t.\t+");
        assert_eq!(promoter_genes(&promoters), HashSet::from(["ENSG01".to_string()]));
    }
}
