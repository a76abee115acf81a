//! Region handling shared by the promoter, FIMO and network steps. Records,
//! interval trees and merging come from `bed_utils`.
use anyhow::{anyhow, Result};
use bed_utils::bed::{tree::BedTree, BEDLike, GenomicRange, BED};
use std::io::BufRead;

use crate::genome::ChromSizes;

fn is_header(line: &str) -> bool {
    line.trim().is_empty()
        || line.starts_with('#')
        || line.starts_with("track")
        || line.starts_with("browser")
}

/// Read the first three columns of every record. Blank lines and `#`,
/// `track` or `browser` lines are skipped.
pub fn read_bed3<R: BufRead>(input: R) -> Result<Vec<GenomicRange>> {
    let mut regions = Vec::new();
    for line in input.lines() {
        let line = line?;
        if is_header(&line) {
            continue;
        }
        let fields: Vec<&str> = line.trim_end_matches('\r').splitn(4, '\t').take(3).collect();
        let bed: BED<3> = fields.join("\t").parse()
            .map_err(|e| anyhow!("invalid BED record '{}': {:?}", line, e))?;
        regions.push(bed.to_genomic_range());
    }
    Ok(regions)
}

/// For every record and every interval of `tree` it overlaps, report the
/// overlapping part of the record. Records without overlap are dropped.
pub fn intersect<'a, B, D, I>(input: I, tree: &'a BedTree<D>) -> impl Iterator<Item = B> + 'a
where
    I: IntoIterator<Item = B>,
    I::IntoIter: 'a,
    B: BEDLike + Clone + 'a,
{
    input.into_iter().flat_map(move |bed| {
        tree.find(&bed).map(|(hit, _)| {
            let mut part = bed.clone();
            part.set_start(bed.start().max(hit.start()));
            part.set_end(bed.end().min(hit.end()));
            part
        }).collect::<Vec<_>>()
    })
}

/// Restrict a record to `[0, chrom_len)`. Records on chromosomes absent from
/// `chrom_sizes` are dropped.
pub fn clip_bed<B: BEDLike>(mut bed: B, chrom_sizes: &ChromSizes) -> Option<B> {
    let max_len = chrom_sizes.get(bed.chrom())?;
    let new_start = bed.start().min(max_len);
    let new_end = bed.end().min(max_len);
    bed.set_start(new_start);
    bed.set_end(new_end);
    Some(bed)
}
