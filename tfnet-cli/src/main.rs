use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use log::{info, warn};
use std::collections::HashSet;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use tfnet_core::bed::read_bed3;
use tfnet_core::fimo::{FimoRegionJob, FimoRunner};
use tfnet_core::genome::{gene_promoters, write_bed, PromoterOptions, TssType};
use tfnet_core::identifiers::{match_gene_identifiers, GeneQuery, MyGeneClient, Species};
use tfnet_core::motif::subset_meme;
use tfnet_core::pipeline;
use tfnet_core::utils::{open_file_for_read, open_file_for_write, Compression};

/// Build TF-gene regulatory networks from predicted binding sites.
#[derive(Parser, Debug)]
#[command(name = "tfnet", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline described by a JSON configuration.
    Network {
        config: PathBuf,
    },
    /// Count motif binding sites in the regions of a BED file with FIMO.
    FimoRegions(FimoRegionsArgs),
    /// Write promoter windows around the TSS of genes as BED6.
    Promoters(PromotersArgs),
    /// Keep only selected motifs of a MEME file.
    SubsetMeme(SubsetMemeArgs),
    /// Map gene identifiers through a GTF file and mygene.info.
    GeneIds(GeneIdsArgs),
}

#[derive(Args, Debug)]
struct FimoRegionsArgs {
    #[arg(long)]
    bed_file: PathBuf,
    /// MEME motif file.
    #[arg(long)]
    pwms: PathBuf,
    #[arg(long)]
    fasta: PathBuf,
    #[arg(long, default_value = "fimo")]
    fimo_src: PathBuf,
    #[arg(long, default_value = "samtools")]
    samtools_src: PathBuf,
    #[arg(long)]
    out_dir: PathBuf,
    /// Keep the matched sequence in FIMO's output.
    #[arg(long)]
    write_sequence: bool,
}

#[derive(Args, Debug)]
struct PromotersArgs {
    #[arg(long)]
    gtf: PathBuf,
    #[arg(long, default_value_t = 200)]
    extend: u64,
    /// `5` for the 5' TSS of each gene, `all` for the TSS of all transcripts.
    #[arg(long, default_value = "5")]
    tss_type: TssType,
    /// Merge overlapping windows of the same gene.
    #[arg(long)]
    merge: bool,
    /// Only keep the parts of windows overlapping these regions.
    #[arg(long)]
    open_regions: Option<PathBuf>,
    /// Gene IDs or names, comma-separated.
    #[arg(long, value_delimiter = ',')]
    genes: Option<Vec<String>>,
    /// Output file, gzipped if it ends with `.gz`. Defaults to stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SubsetMemeArgs {
    #[arg(long)]
    meme: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, num_args = 1.., required = true)]
    motifs: Vec<String>,
    /// Also keep dimers with a selected monomer.
    #[arg(long)]
    include_dimers: bool,
    /// Compare full motif names, including version suffixes.
    #[arg(long)]
    exact_match: bool,
}

#[derive(Args, Debug)]
struct GeneIdsArgs {
    #[arg(long, num_args = 1.., required = true)]
    ids: Vec<String>,
    #[arg(long, default_value = "human")]
    species: Species,
    #[arg(long, default_value = "symbol,alias,uniprot")]
    scopes: String,
    #[arg(long, default_value = "ensembl,symbol")]
    fields: String,
    #[arg(long)]
    gtf: Option<PathBuf>,
    #[arg(long)]
    ensembl_only: bool,
}

fn promoters(args: PromotersArgs) -> Result<()> {
    let open_regions = match &args.open_regions {
        Some(bed) => Some(read_bed3(open_file_for_read(bed)?)?),
        None => None,
    };
    let options = PromoterOptions {
        extend: args.extend,
        tss_type: args.tss_type,
        gene_set: args.genes.map(|x| x.into_iter().collect::<HashSet<_>>()),
        merge: args.merge,
        open_regions,
    };
    let windows = gene_promoters(&args.gtf, &options)?;
    info!("{} promoter windows", windows.len());
    let mut writer: Box<dyn Write> = match &args.out {
        Some(out) => {
            let compression = out.extension().filter(|x| *x == "gz")
                .map(|_| Compression::Gzip);
            open_file_for_write(out, compression, None)?
        }
        None => Box::new(BufWriter::new(io::stdout())),
    };
    write_bed(&mut writer, &windows)?;
    writer.flush()?;
    Ok(())
}

fn gene_ids(args: GeneIdsArgs) -> Result<()> {
    let mut query = GeneQuery::new(args.species, &args.scopes, &args.fields);
    query.ensembl_only = args.ensembl_only;
    let (mapped, missed) = match_gene_identifiers(&args.ids, args.gtf.as_deref(), &query, &MyGeneClient::new()?)?;
    let fields: Vec<&str> = args.fields.split(',').map(str::trim).filter(|x| !x.is_empty()).collect();

    let mut out = BufWriter::new(io::stdout());
    writeln!(out, "query\t{}", fields.iter().join("\t"))?;
    for (id, hit) in &mapped {
        let values = fields.iter().map(|f| hit.get(*f).map(String::as_str).unwrap_or("")).join("\t");
        writeln!(out, "{}\t{}", id, values)?;
    }
    out.flush()?;
    if !missed.is_empty() {
        warn!("{} identifiers not found: {}", missed.len(), missed.iter().join(", "));
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Network { config } => {
            pipeline::run(&config, &MyGeneClient::new()?)?;
        }
        Command::FimoRegions(args) => {
            let mut fimo = FimoRunner::new(args.fimo_src);
            fimo.write_sequence = args.write_sequence;
            let job = FimoRegionJob {
                bed_file: args.bed_file,
                pwms: args.pwms,
                fasta: args.fasta,
                fimo,
                samtools: args.samtools_src,
                out_dir: args.out_dir,
            };
            job.run()?;
        }
        Command::Promoters(args) => promoters(args)?,
        Command::SubsetMeme(args) => {
            let names: HashSet<String> = args.motifs.into_iter().collect();
            subset_meme(&args.meme, &names, &args.out, args.include_dimers, args.exact_match)?;
        }
        Command::GeneIds(args) => gene_ids(args)?,
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    run(Cli::parse())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        let cli = Cli::try_parse_from(["tfnet", "network", "run.json"]).unwrap();
        match cli.command {
            Command::Network { config } => assert_eq!(config, PathBuf::from("run.json")),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_promoters() {
        let cli = Cli::try_parse_from([
            "tfnet", "promoters", "--gtf", "genes.gtf.gz", "--tss-type", "all",
            "--merge", "--genes", "ENSG01,FOS",
        ]).unwrap();
        match cli.command {
            Command::Promoters(args) => {
                assert_eq!(args.extend, 200);
                assert_eq!(args.tss_type, TssType::All);
                assert!(args.merge);
                assert_eq!(args.genes, Some(vec!["ENSG01".to_string(), "FOS".to_string()]));
                assert!(args.out.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(Cli::try_parse_from(["tfnet", "promoters", "--gtf", "a.gtf", "--tss-type", "3"]).is_err());
    }

    #[test]
    fn test_parse_subset_meme() {
        let cli = Cli::try_parse_from([
            "tfnet", "subset-meme", "--meme", "in.meme", "--out", "out.meme",
            "--motifs", "FOS", "JUN", "--include-dimers",
        ]).unwrap();
        match cli.command {
            Command::SubsetMeme(args) => {
                assert_eq!(args.motifs, vec!["FOS", "JUN"]);
                assert!(args.include_dimers);
                assert!(!args.exact_match);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(Cli::try_parse_from(["tfnet", "subset-meme", "--meme", "a", "--out", "b"]).is_err());
    }

    #[test]
    fn test_parse_fimo_regions() {
        let cli = Cli::try_parse_from([
            "tfnet", "fimo-regions", "--bed-file", "peaks.bed", "--pwms", "m.meme",
            "--fasta", "hg38.fa", "--out-dir", "fimo",
        ]).unwrap();
        match cli.command {
            Command::FimoRegions(args) => {
                assert_eq!(args.fimo_src, PathBuf::from("fimo"));
                assert_eq!(args.samtools_src, PathBuf::from("samtools"));
                assert!(!args.write_sequence);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_gene_ids() {
        let cli = Cli::try_parse_from(["tfnet", "gene-ids", "--ids", "FOS", "--species", "mouse"]).unwrap();
        match cli.command {
            Command::GeneIds(args) => {
                assert_eq!(args.species, Species::Mouse);
                assert_eq!(args.scopes, "symbol,alias,uniprot");
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert!(Cli::try_parse_from(["tfnet", "gene-ids", "--ids", "FOS", "--species", "yeast"]).is_err());
    }
}
