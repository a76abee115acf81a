//! Running the FIMO motif scanner on a set of genomic regions.
use anyhow::{bail, ensure, Context, Result};
use log::{info, warn};
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use bed_utils::bed::{BEDLike, GenomicRange};

use crate::bed::{clip_bed, read_bed3};
use crate::genome::ChromSizes;
use crate::motif::{fit_background, Meme};
use crate::tfbs::{read_fimo_hits, TfbsMatrix};
use crate::utils::{open_file_for_read, open_file_for_write, Compression};

pub const SEQUENCE_FILE: &str = "Sequences.fa";
pub const FIMO_OUTPUT: &str = "Out_Fimo.tsv.gz";
pub const TFBS_MATRIX: &str = "Out_Fimo_TFBSMatrix.txt.gz";

/// Restrict regions to the chromosome bounds and drop those of length 1 or 0.
/// Regions on chromosomes missing from `chrom_sizes` are dropped as well.
pub fn prepare_regions(regions: Vec<GenomicRange>, chrom_sizes: &ChromSizes) -> Result<Vec<GenomicRange>> {
    let n = regions.len();
    let regions: Vec<GenomicRange> = regions.into_iter()
        .filter_map(|x| clip_bed(x, chrom_sizes))
        .filter(|x| x.len() > 1)
        .collect();
    if regions.is_empty() {
        bail!("No remaining region after capping at locations covered by the fasta file");
    }
    if regions.len() < n {
        warn!("{} regions removed after capping at the chromosome bounds", n - regions.len());
    }
    Ok(regions)
}

fn run_command(executable: &Path, args: &[&std::ffi::OsStr]) -> Result<()> {
    let output = Command::new(executable).args(args).output().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            anyhow::anyhow!("executable not found: {}", executable.display())
        } else {
            anyhow::Error::new(e).context(format!("failed to run {}", executable.display()))
        }
    })?;
    if !output.status.success() {
        bail!(
            "{} failed (status={:?}): {}",
            executable.display(),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim(),
        );
    }
    Ok(())
}

fn fai_path(fasta: &Path) -> PathBuf {
    let mut path = fasta.as_os_str().to_owned();
    path.push(".fai");
    PathBuf::from(path)
}

/// Create `<fasta>.fai` with `samtools faidx` if it does not exist.
pub fn ensure_fasta_index<P: AsRef<Path>, Q: AsRef<Path>>(fasta: P, samtools: Q) -> Result<()> {
    let fasta = fasta.as_ref();
    if !fai_path(fasta).exists() {
        info!("Genome index missing, creating with samtools faidx");
        run_command(samtools.as_ref(), &[std::ffi::OsStr::new("faidx"), fasta.as_os_str()])?;
    }
    Ok(())
}

/// Write the sequence of every region, named `chrom:start-end`.
pub fn write_region_sequences<P, Q>(fasta: P, regions: &[GenomicRange], out: Q) -> Result<()>
where
    P: AsRef<Path> + std::fmt::Debug,
    Q: AsRef<Path>,
{
    let mut reader = bio::io::fasta::IndexedReader::from_file(&fasta)?;
    let mut writer = bio::io::fasta::Writer::new(open_file_for_write(&out, None, None)?);
    let mut seq = Vec::new();
    for region in regions {
        reader.fetch(region.chrom(), region.start(), region.end())
            .with_context(|| format!("cannot fetch region: {}", region.pretty_show()))?;
        reader.read(&mut seq)?;
        writer.write(&region.pretty_show(), None, &seq)?;
    }
    writer.flush()?;
    info!("Sequence fasta stored at {}", out.as_ref().display());
    Ok(())
}

/// Invocation of the FIMO executable.
#[derive(Debug, Clone)]
pub struct FimoRunner {
    pub executable: PathBuf,
    pub thresh: f64,
    /// Report the matched sequence of every hit.
    pub write_sequence: bool,
}

impl FimoRunner {
    pub fn new<P: Into<PathBuf>>(executable: P) -> Self {
        Self { executable: executable.into(), thresh: 1e-4, write_sequence: false }
    }

    fn args(&self, meme: &Path, sequences: &Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = vec![
            "--thresh".into(), self.thresh.to_string().into(), "--text".into(),
        ];
        if !self.write_sequence {
            args.push("--skip-matched-sequence".into());
        }
        for arg in ["--verbosity", "1", "--bfile", "--motif--"] {
            args.push(arg.into());
        }
        args.push(meme.as_os_str().to_owned());
        args.push(sequences.as_os_str().to_owned());
        args
    }

    /// Scan `sequences` with the motifs of `meme`, writing FIMO's table gzipped to `out`.
    pub fn run<P: AsRef<Path>, Q: AsRef<Path>, R: AsRef<Path>>(&self, meme: P, sequences: Q, out: R) -> Result<()> {
        info!("Running Fimo");
        let mut writer = open_file_for_write(&out, Some(Compression::Gzip), None)?;
        let mut child = Command::new(&self.executable)
            .args(self.args(meme.as_ref(), sequences.as_ref()))
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to run FIMO: {}", self.executable.display()))?;
        if let Some(mut stdout) = child.stdout.take() {
            io::copy(&mut stdout, &mut writer)?;
        }
        writer.flush()?;
        let status = child.wait()?;
        ensure!(status.success(), "FIMO exited with status {:?}", status.code());
        info!("Fimo output at {}", out.as_ref().display());
        Ok(())
    }
}

/// Annotate binding sites in the regions of a BED file: extract the region
/// sequences, fit the motif background to them, run FIMO and count the sites
/// per region and motif.
#[derive(Debug, Clone)]
pub struct FimoRegionJob {
    pub bed_file: PathBuf,
    pub pwms: PathBuf,
    pub fasta: PathBuf,
    pub fimo: FimoRunner,
    pub samtools: PathBuf,
    pub out_dir: PathBuf,
}

impl FimoRegionJob {
    /// Run all steps and return the path of the TFBS matrix.
    pub fn run(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("cannot create directory: {}", self.out_dir.display()))?;
        ensure_fasta_index(&self.fasta, &self.samtools)?;

        let regions = read_bed3(open_file_for_read(&self.bed_file)?)
            .with_context(|| format!("cannot read regions: {}", self.bed_file.display()))?;
        let chrom_sizes = ChromSizes::from_fasta_index(&self.fasta)?;
        let regions = prepare_regions(regions, &chrom_sizes)?;

        let seq_out = self.out_dir.join(SEQUENCE_FILE);
        write_region_sequences(&self.fasta, &regions, &seq_out)?;
        let meme_bg = fit_background(&self.pwms, &seq_out, &self.out_dir)?;

        let fimo_out = self.out_dir.join(FIMO_OUTPUT);
        self.fimo.run(&meme_bg, &seq_out, &fimo_out)?;

        let matrix_out = self.out_dir.join(TFBS_MATRIX);
        count_binding_sites(&fimo_out, &self.pwms, self.fimo.write_sequence, &matrix_out)?;
        Ok(matrix_out)
    }
}

/// Turn FIMO's output into a TFBS matrix over the motifs of `meme_file`.
pub fn count_binding_sites<P: AsRef<Path>, Q: AsRef<Path>, R: AsRef<Path>>(
    fimo_out: P,
    meme_file: Q,
    write_sequence: bool,
    out: R,
) -> Result<TfbsMatrix> {
    info!("Processing Fimo output");
    let hits = read_fimo_hits(open_file_for_read(&fimo_out)?, write_sequence)
        .with_context(|| format!("cannot read FIMO output: {}", fimo_out.as_ref().display()))?;
    let motifs = Meme::read(&meme_file)?.motif_names().into_iter().map(str::to_string).collect();
    let matrix = TfbsMatrix::from_hits(hits, motifs);
    let mut writer = open_file_for_write(&out, Some(Compression::Gzip), None)?;
    matrix.write(&mut writer)?;
    writer.flush()?;
    info!("FIMO hits counted: {}", out.as_ref().display());
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_regions() {
        let sizes: ChromSizes = vec![("chr1", 100), ("chr2", 50)].into_iter().collect();
        let regions = vec![
            GenomicRange::new("chr1", 90, 150),
            GenomicRange::new("chr1", 99, 120),
            GenomicRange::new("chr2", 10, 20),
            GenomicRange::new("chr3", 10, 20),
        ];
        let result = prepare_regions(regions, &sizes).unwrap();
        assert_eq!(result, vec![GenomicRange::new("chr1", 90, 100), GenomicRange::new("chr2", 10, 20)]);

        let err = prepare_regions(vec![GenomicRange::new("chr1", 100, 200)], &sizes);
        assert!(err.is_err());
    }

    #[test]
    fn test_region_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let fasta = dir.path().join("genome.fa");
        std::fs::write(&fasta, ">chr1\nACGTACGTAC\nGGGGCCCC\n>chr2\nTTTTAAAA\n").unwrap();
        std::fs::write(fai_path(&fasta), "chr1\t18\t6\t10\t11\nchr2\t8\t32\t8\t9\n").unwrap();
        // The index exists, so samtools is never called.
        ensure_fasta_index(&fasta, "/nonexistent/samtools").unwrap();

        let sizes = ChromSizes::from_fasta_index(&fasta).unwrap();
        assert_eq!(sizes.get("chr1"), Some(18));

        let out = dir.path().join("seqs.fa");
        let regions = vec![GenomicRange::new("chr1", 8, 12), GenomicRange::new("chr2", 0, 3)];
        write_region_sequences(&fasta, &regions, &out).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), ">chr1:8-12\nACGG\n>chr2:0-3\nTTT\n");
    }

    #[test]
    fn test_fimo_args() {
        let runner = FimoRunner::new("fimo");
        let args: Vec<String> = runner.args(Path::new("m.txt"), Path::new("s.fa"))
            .into_iter().map(|x| x.into_string().unwrap()).collect();
        assert_eq!(args.join(" "), "--thresh 0.0001 --text --skip-matched-sequence --verbosity 1 --bfile --motif-- m.txt s.fa");
    }

    const MEME: &str = "MEME version 4\n\nMOTIF A\n0.1 0.2 0.3 0.4\n\nMOTIF B\n0.1 0.2 0.3 0.4\n";

    const FAKE_OUTPUT: &str = "motif_id\tmotif_alt_id\tsequence_name\tstart\tstop\tstrand
A\t\tchr1:0-10\t2\t6\t+
B\t\tchr2:0-8\t1\t4\t-
";

    /// A stand-in for the FIMO executable that prints a fixed table.
    fn fake_fimo(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fimo");
        let script = format!("#!/bin/sh\ncat <<'EOF'\n{}EOF\n", FAKE_OUTPUT);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_fimo_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FimoRunner::new(fake_fimo(dir.path()));
        let out = dir.path().join("out.tsv.gz");
        runner.run("m.txt", "s.fa", &out).unwrap();

        let mut text = String::new();
        std::io::Read::read_to_string(&mut open_file_for_read(&out).unwrap(), &mut text).unwrap();
        assert_eq!(text, FAKE_OUTPUT);
    }

    #[test]
    fn test_region_job() {
        let dir = tempfile::tempdir().unwrap();
        let fasta = dir.path().join("genome.fa");
        std::fs::write(&fasta, ">chr1\nACGTACGTAC\nGGGGCCCC\n>chr2\nTTTTAAAA\n").unwrap();
        std::fs::write(fai_path(&fasta), "chr1\t18\t6\t10\t11\nchr2\t8\t32\t8\t9\n").unwrap();
        let bed_file = dir.path().join("peaks.bed");
        std::fs::write(&bed_file, "chr1\t0\t10\nchr2\t0\t8\nchrM\t0\t8\n").unwrap();
        let pwms = dir.path().join("motifs.txt");
        std::fs::write(&pwms, MEME).unwrap();

        let out_dir = dir.path().join("run");
        let job = FimoRegionJob {
            bed_file,
            pwms,
            fasta,
            fimo: FimoRunner::new(fake_fimo(dir.path())),
            samtools: PathBuf::from("/nonexistent/samtools"),
            out_dir: out_dir.clone(),
        };
        let matrix_file = job.run().unwrap();
        assert_eq!(matrix_file, out_dir.join(TFBS_MATRIX));
        assert_eq!(
            std::fs::read_to_string(out_dir.join(SEQUENCE_FILE)).unwrap(),
            ">chr1:0-10\nACGTACGTAC\n>chr2:0-8\nTTTTAAAA\n",
        );
        assert!(out_dir.join("motifs_bg.txt").exists());

        let matrix = TfbsMatrix::read(open_file_for_read(&matrix_file).unwrap()).unwrap();
        assert_eq!(matrix.motifs(), &["A".to_string(), "B".to_string()]);
        assert_eq!(matrix.get("chr1:0-10"), Some(&vec![1, 0]));
        assert_eq!(matrix.get("chr2:0-8"), Some(&vec![0, 1]));
    }

    #[test]
    fn test_missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FimoRunner::new("/nonexistent/fimo");
        let out = dir.path().join("out.tsv.gz");
        assert!(runner.run("m.txt", "s.fa", &out).is_err());
        // The output is opened before FIMO is started.
        assert!(out.exists());
    }

    #[test]
    fn test_count_binding_sites() {
        let dir = tempfile::tempdir().unwrap();
        let meme = dir.path().join("motifs.txt");
        std::fs::write(&meme, MEME).unwrap();
        let fimo_out = dir.path().join(FIMO_OUTPUT);
        let mut w = open_file_for_write(&fimo_out, Some(Compression::Gzip), None).unwrap();
        w.write_all(b"motif_id\tmotif_alt_id\tsequence_name\tstart\tstop\tstrand\tscore\tp-value\tq-value\n\
B\t\tchr1:0-50\t3\t9\t+\t1\t1e-5\t\n\
B\t\tchr1:0-50\t30\t39\t+\t1\t1e-5\t\n").unwrap();
        drop(w);

        let out = dir.path().join(TFBS_MATRIX);
        let matrix = count_binding_sites(&fimo_out, &meme, false, &out).unwrap();
        assert_eq!(matrix.get("chr1:0-50"), Some(&vec![0, 2]));
        let reread = TfbsMatrix::read(open_file_for_read(&out).unwrap()).unwrap();
        assert_eq!(reread, matrix);
    }
}
