use crate::lupin_common::*;

use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    let file = File::open(input_file)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", input_file, e))?;
    match ext {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(BufWriter::new(std::io::stdout())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    let file = File::create(output_file)?;
    match ext {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

///
/// Create a directory if needed
/// * `file` - file name
///
pub fn mkdir(file: &str) -> anyhow::Result<()> {
    if let Some(dir) = Path::new(file).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}

///
/// Read every non-empty line of the input file into memory,
/// skipping `#` comments
///
pub fn read_lines(input_file: &str) -> anyhow::Result<Vec<Box<str>>> {
    let mut lines = vec![];
    for line in open_buf_reader(input_file)?.lines() {
        let line = line?;
        let line = line.trim_end();
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        lines.push(line.into());
    }
    Ok(lines)
}

///
/// Write every line into the output file
///
pub fn write_types<T>(lines: &[T], output_file: &str) -> anyhow::Result<()>
where
    T: std::fmt::Display,
{
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    Ok(())
}

/// Cells x genes count matrix with names
pub struct CountTable {
    pub cells: Vec<Box<str>>,
    pub genes: Vec<Box<str>>,
    /// row-major cells x genes
    pub counts: Vec<f32>,
}

impl CountTable {
    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn num_genes(&self) -> usize {
        self.genes.len()
    }
}

///
/// Read a tab-separated count matrix: the header line holds gene
/// names after a leading corner field; each following line holds a
/// cell name and its counts
///
pub fn read_count_table(input_file: &str) -> anyhow::Result<CountTable> {
    let lines = read_lines(input_file)?;
    let (header, rows) = lines
        .split_first()
        .ok_or(anyhow::anyhow!("empty count file {}", input_file))?;

    let genes = header
        .split('\t')
        .skip(1)
        .map(Box::from)
        .collect::<Vec<Box<str>>>();
    let ngenes = genes.len();
    if ngenes == 0 {
        return Err(anyhow::anyhow!("no genes in the header of {}", input_file));
    }

    let parsed = rows
        .par_iter()
        .enumerate()
        .map(|(i, line)| -> anyhow::Result<(Box<str>, Vec<f32>)> {
            let mut words = line.split('\t');
            let cell = words
                .next()
                .ok_or(anyhow::anyhow!("empty line {}", i + 2))?;
            let values = words
                .map(|w| {
                    w.trim()
                        .parse::<f32>()
                        .map_err(|e| anyhow::anyhow!("line {}: {} ({})", i + 2, e, w))
                })
                .collect::<anyhow::Result<Vec<f32>>>()?;
            if values.len() != ngenes {
                return Err(anyhow::anyhow!(
                    "line {}: {} values for {} genes",
                    i + 2,
                    values.len(),
                    ngenes
                ));
            }
            Ok((cell.into(), values))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut cells = Vec::with_capacity(parsed.len());
    let mut counts = Vec::with_capacity(parsed.len() * ngenes);
    for (cell, values) in parsed {
        cells.push(cell);
        counts.extend(values);
    }

    debug!("read {} cells x {} genes", cells.len(), ngenes);
    Ok(CountTable {
        cells,
        genes,
        counts,
    })
}

/// Categorical assignment of cells, possibly with missing entries
pub struct Categories {
    /// category names, sorted
    pub names: Vec<Box<str>>,
    pub index: Vec<Option<u32>>,
}

///
/// Read one category name per line; `NA` marks a missing value
///
pub fn read_categories(input_file: &str) -> anyhow::Result<Categories> {
    let lines = read_lines(input_file)?;
    let names = lines
        .iter()
        .filter(|s| s.as_ref() != MISSING_LABEL)
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let index = lines
        .iter()
        .map(|s| {
            names
                .binary_search(s)
                .ok()
                .map(|k| k as u32)
        })
        .collect();

    Ok(Categories { names, index })
}

///
/// Write a named matrix as tab-separated values
///
/// * `row_names` - one per row
/// * `col_names` - column header
/// * `data` - row-major values
///
pub fn write_named_matrix(
    row_names: &[Box<str>],
    col_names: &[Box<str>],
    data: &[Vec<f32>],
    output_file: &str,
) -> anyhow::Result<()> {
    if row_names.len() != data.len() {
        return Err(anyhow::anyhow!(
            "{} row names for {} rows",
            row_names.len(),
            data.len()
        ));
    }
    let mut buf = open_buf_writer(output_file)?;
    writeln!(buf, "\t{}", col_names.join("\t"))?;
    for (name, row) in row_names.iter().zip(data) {
        let values = row.iter().map(|v| v.to_string()).collect::<Vec<_>>();
        writeln!(buf, "{}\t{}", name, values.join("\t"))?;
    }
    buf.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_table_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("counts.tsv.gz");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;

        let cells: Vec<Box<str>> = vec!["c1".into(), "c2".into()];
        let genes: Vec<Box<str>> = vec!["g1".into(), "g2".into(), "g3".into()];
        let data = vec![vec![0., 1., 2.], vec![3., 0., 5.]];
        write_named_matrix(&cells, &genes, &data, file)?;

        let table = read_count_table(file)?;
        assert_eq!(table.cells, cells);
        assert_eq!(table.genes, genes);
        assert_eq!(table.counts, vec![0., 1., 2., 3., 0., 5.]);
        Ok(())
    }

    #[test]
    fn ragged_rows_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("bad.tsv");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;
        write_types(&["\tg1\tg2", "c1\t1\t2", "c2\t1"], file)?;
        assert!(read_count_table(file).is_err());
        Ok(())
    }

    #[test]
    fn categories_with_missing_values() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("labels.txt.gz");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;
        write_types(&["tcell", "NA", "bcell", "tcell"], file)?;

        let cats = read_categories(file)?;
        assert_eq!(cats.names, vec![Box::<str>::from("bcell"), Box::<str>::from("tcell")]);
        assert_eq!(cats.index, vec![Some(1), None, Some(0), Some(1)]);
        Ok(())
    }
}
