//! The full run: motif selection, binding site annotation of the open
//! regions and the TF-gene network.
use anyhow::{Context, Result};
use log::{info, warn};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::bed::read_bed3;
use crate::config::{write_config_copy, NetworkConfig};
use crate::fimo::{FimoRegionJob, FimoRunner, TFBS_MATRIX};
use crate::genome::{gene_promoters, promoter_genes, PromoterOptions, TssType};
use crate::identifiers::GeneQueryService;
use crate::motif::{motif_id_map, subset_meme, Meme};
use crate::network::{normalize_region, Interactions, TfGeneNetwork, NETWORK_OUTPUT};
use crate::tfbs::TfbsMatrix;
use crate::utils::{open_file_for_read, open_file_for_write, Compression};

pub const FIMO_DIR: &str = "FimoRuns";
pub const SUBSET_MEME: &str = "OpenTFs_meme.txt";

/// Motifs to scan for. With `open_tfs_only`, only motifs whose TFs all have
/// a promoter overlapping an open region are kept.
fn select_motifs<S: GeneQueryService + ?Sized>(config: &NetworkConfig, service: &S) -> Result<HashSet<String>> {
    let meme = Meme::read(&config.pwm_file)?;
    let id_map = motif_id_map(&meme, Some(config.gtf_file.as_path()), service, config.species)?;
    if !id_map.misses.is_empty() {
        warn!("{} motifs could not be mapped to genes", id_map.misses.len());
    }

    if !config.open_tfs_only {
        return Ok(id_map.ids.into_keys().collect());
    }
    let open_regions = read_bed3(open_file_for_read(&config.peak_file)?)
        .with_context(|| format!("cannot read peaks: {}", config.peak_file.display()))?;
    let options = PromoterOptions {
        extend: config.promoter_extend,
        tss_type: TssType::All,
        merge: true,
        open_regions: Some(open_regions),
        ..Default::default()
    };
    let open_genes = promoter_genes(&gene_promoters(&config.gtf_file, &options)?);
    let keep: HashSet<String> = id_map.ids.into_iter()
        .filter(|(_, ids)| ids.iter().all(|id| open_genes.contains(id)))
        .map(|(motif, _)| motif)
        .collect();
    info!("{} motifs of TFs with an open promoter", keep.len());
    Ok(keep)
}

/// Run FIMO on the open regions unless a TFBS matrix already exists.
fn tfbs_matrix<S: GeneQueryService + ?Sized>(config: &NetworkConfig, fimo_dir: &Path, service: &S) -> Result<PathBuf> {
    let matrix_file = fimo_dir.join(TFBS_MATRIX);
    if matrix_file.is_file() {
        info!("Using existing FIMO output: {}", matrix_file.display());
        return Ok(matrix_file);
    }
    let keep = select_motifs(config, service)?;
    let subset = fimo_dir.join(SUBSET_MEME);
    subset_meme(&config.pwm_file, &keep, &subset, false, true)?;

    let mut fimo = FimoRunner::new(config.fimo_src.clone());
    fimo.write_sequence = config.write_sequence;
    let job = FimoRegionJob {
        bed_file: config.peak_file.clone(),
        pwms: subset,
        fasta: config.fasta_file.clone(),
        fimo,
        samtools: config.samtools_src.clone(),
        out_dir: fimo_dir.to_path_buf(),
    };
    job.run()
}

/// Build the TF-gene network of a configuration and write
/// `<output_path>/TFGeneNet.txt.gz`.
pub fn run<S: GeneQueryService + ?Sized>(config_file: &Path, service: &S) -> Result<PathBuf> {
    let (config, raw) = NetworkConfig::from_file(config_file)?;
    if config.output_path.is_dir() {
        warn!("output_path already exists, will write files into it");
    }
    let fimo_dir = config.output_path.join(FIMO_DIR);
    fs::create_dir_all(&fimo_dir)
        .with_context(|| format!("cannot create directory: {}", fimo_dir.display()))?;
    let name = config_file.file_name().and_then(|x| x.to_str()).unwrap_or("config.json");
    write_config_copy(&raw, &config.output_path, name)?;

    let matrix_file = tfbs_matrix(&config, &fimo_dir, service)?;
    build_network(&config, &matrix_file)
}

/// Compute and write the network from an existing TFBS matrix.
pub fn build_network(config: &NetworkConfig, matrix_file: &Path) -> Result<PathBuf> {
    let matrix = TfbsMatrix::read(open_file_for_read(matrix_file)?)
        .with_context(|| format!("cannot read TFBS matrix: {}", matrix_file.display()))?
        .map_regions(normalize_region);
    let interactions = Interactions::read(open_file_for_read(&config.abc_interactions)?)
        .with_context(|| format!("cannot read interactions: {}", config.abc_interactions.display()))?;
    info!(
        "{} genes with {} interacting regions, {} regions with binding sites",
        interactions.num_genes(), interactions.num_regions(), matrix.num_regions(),
    );

    let start = Instant::now();
    let network = TfGeneNetwork::build(&matrix, &interactions, config.pvalue_cutoff, config.cores)?;
    info!("TF weights computed in {:.2} seconds", start.elapsed().as_secs_f64());

    let out = config.output_path.join(NETWORK_OUTPUT);
    let mut writer = open_file_for_write(&out, Some(Compression::Gzip), None)?;
    network.write(&mut writer)?;
    writer.flush()?;
    info!("Network written to {}", out.display());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::GeneQuery;
    use serde_json::Value;
    use std::io::Read;

    struct Offline;

    impl GeneQueryService for Offline {
        fn query(&self, _identifiers: &[String], _query: &GeneQuery) -> Result<Vec<Value>> {
            panic!("no remote query expected");
        }
    }

    #[test]
    fn test_run_with_existing_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        let fimo_dir = out_dir.join(FIMO_DIR);
        fs::create_dir_all(&fimo_dir).unwrap();

        let mut w = open_file_for_write(fimo_dir.join(TFBS_MATRIX), Some(Compression::Gzip), None).unwrap();
        w.write_all(b"region\tA\nchr1:0-10\t1\nchr1:20-30\t2\nchr1:40-50\t1\n").unwrap();
        drop(w);

        let mut abc = String::from("PeakID\tEnsembl ID\n");
        abc.push_str("1:0-10\tENSG2.1\n1:20-30\tENSG2.1\n1:40-50\tENSG2.1\n");
        (100..107).for_each(|i| abc.push_str(&format!("1:{}-{}\tENSG1.1\n", i * 10, i * 10 + 5)));
        let abc_file = dir.path().join("abc.txt");
        fs::write(&abc_file, abc).unwrap();

        let config = serde_json::json!({
            "output_path": out_dir,
            "pwm_file": dir.path().join("unused.meme"),
            "gtf_file": dir.path().join("unused.gtf"),
            "peak_file": dir.path().join("unused.bed"),
            "fasta_file": dir.path().join("unused.fa"),
            "abc_interactions": abc_file,
            "cores": 2,
            "open_tfs_only": false,
        });
        let config_file = dir.path().join("run.json");
        fs::write(&config_file, config.to_string()).unwrap();

        let net_file = run(&config_file, &Offline).unwrap();
        assert!(out_dir.join("run.json").is_file());

        let mut text = String::new();
        open_file_for_read(&net_file).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "Ensembl ID\t#CREs\tA\nENSG1\t7\t0\nENSG2\t3\t1.0\n");
    }

    const GTF: &str = "chr1\tHAVANA\tgene\t1000\t5000\t.\t+\t.\tgene_id \"ENSG01.3\"; gene_name \"FOS\";
chr1\tHAVANA\ttranscript\t1000\t5000\t.\t+\t.\tgene_id \"ENSG01.3\"; transcript_id \"ENST01.1\"; gene_name \"FOS\";
chr2\tHAVANA\tgene\t100\t900\t.\t-\t.\tgene_id \"ENSG02.1\"; gene_name \"JUN\";
chr2\tHAVANA\ttranscript\t100\t900\t.\t-\t.\tgene_id \"ENSG02.1\"; transcript_id \"ENST02.1\"; gene_name \"JUN\";
";

    const MEME: &str = "MEME version 4\n\nMOTIF FOS\n0.1 0.2 0.3 0.4\n\nMOTIF JUN\n0.1 0.2 0.3 0.4\n\nMOTIF FOS::JUN\n0.1 0.2 0.3 0.4\n";

    #[test]
    fn test_select_open_tfs() {
        let dir = tempfile::tempdir().unwrap();
        let gtf = dir.path().join("anno.gtf");
        fs::write(&gtf, GTF).unwrap();
        let pwms = dir.path().join("motifs.txt");
        fs::write(&pwms, MEME).unwrap();
        // Overlaps the FOS promoter only.
        let peaks = dir.path().join("peaks.bed");
        fs::write(&peaks, "chr1\t900\t1100\nchr2\t5000\t6000\n").unwrap();

        let json = |open_tfs_only: bool| serde_json::json!({
            "output_path": dir.path().join("out"),
            "pwm_file": pwms,
            "gtf_file": gtf,
            "peak_file": peaks,
            "fasta_file": dir.path().join("unused.fa"),
            "abc_interactions": dir.path().join("unused.txt"),
            "open_tfs_only": open_tfs_only,
        }).to_string();

        let (config, _) = NetworkConfig::from_json(&json(true)).unwrap();
        let keep = select_motifs(&config, &Offline).unwrap();
        assert_eq!(keep, HashSet::from(["FOS".to_string()]));

        let (config, _) = NetworkConfig::from_json(&json(false)).unwrap();
        let keep = select_motifs(&config, &Offline).unwrap();
        assert_eq!(keep.len(), 3);
    }
}
