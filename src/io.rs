//! Plain-text tensor dumps.
//!
//! Line-oriented format: layout tag (`dense` or `list`), tensor name, shape,
//! base offsets, then the elements. Dense dumps are column-major (leftmost
//! index fastest) with any whitespace as separator; list dumps carry one
//! nonzero per line as `value idx1 … idxn`. Complex values are written as
//! `(re,im)`, real values as bare floats.

use std::io::{BufRead, Write};

use num_complex::Complex64;

use crate::error::TneError;

/// Element layout of a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpLayout {
    /// All elements, column-major.
    Dense,
    /// One `value idx1 … idxn` line per nonzero.
    List,
}

/// An in-memory tensor dump. Elements are stored dense, column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDump {
    pub name: String,
    pub shape: Vec<u64>,
    pub offsets: Vec<u64>,
    pub elements: Vec<Complex64>,
}

impl TensorDump {
    /// Total element count of the dumped tensor.
    #[must_use]
    pub fn volume(&self) -> u64 {
        self.shape.iter().product()
    }
}

fn format_value(value: Complex64, complex: bool) -> String {
    if complex {
        format!("({},{})", value.re, value.im)
    } else {
        format!("{}", value.re)
    }
}

fn parse_value(token: &str) -> Result<Complex64, TneError> {
    if let Some(inner) = token.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        let (re, im) = inner.split_once(',').ok_or_else(|| {
            TneError::DumpIo(format!("malformed complex value `{token}`"))
        })?;
        let parse = |part: &str| {
            part.parse::<f64>()
                .map_err(|_| TneError::DumpIo(format!("malformed float `{part}`")))
        };
        Ok(Complex64::new(parse(re)?, parse(im)?))
    } else {
        token
            .parse::<f64>()
            .map(|re| Complex64::new(re, 0.0))
            .map_err(|_| TneError::DumpIo(format!("malformed value `{token}`")))
    }
}

/// Writes a dump. `complex` selects the `(re,im)` element notation.
pub fn write_dump(
    writer: &mut impl Write,
    dump: &TensorDump,
    layout: DumpLayout,
    complex: bool,
) -> Result<(), TneError> {
    assert_eq!(dump.volume() as usize, dump.elements.len());
    assert_eq!(dump.shape.len(), dump.offsets.len());
    let tag = match layout {
        DumpLayout::Dense => "dense",
        DumpLayout::List => "list",
    };
    writeln!(writer, "{tag}")?;
    writeln!(writer, "{}", dump.name)?;
    let join = |values: &[u64]| {
        values
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    };
    writeln!(writer, "{}", join(&dump.shape))?;
    writeln!(writer, "{}", join(&dump.offsets))?;
    match layout {
        DumpLayout::Dense => {
            for value in &dump.elements {
                writeln!(writer, "{}", format_value(*value, complex))?;
            }
        }
        DumpLayout::List => {
            let mut indices = vec![0u64; dump.shape.len()];
            for value in &dump.elements {
                if value.norm_sqr() != 0.0 {
                    let line: Vec<String> = std::iter::once(format_value(*value, complex))
                        .chain(indices.iter().map(u64::to_string))
                        .collect();
                    writeln!(writer, "{}", line.join(" "))?;
                }
                // Advance the column-major index counter.
                for (position, index) in indices.iter_mut().enumerate() {
                    *index += 1;
                    if *index < dump.shape[position] {
                        break;
                    }
                    *index = 0;
                }
            }
        }
    }
    Ok(())
}

/// Reads a dump in either layout.
pub fn read_dump(reader: impl BufRead) -> Result<TensorDump, TneError> {
    let mut lines = reader.lines();
    let mut next_line = || -> Result<String, TneError> {
        lines
            .next()
            .transpose()?
            .ok_or_else(|| TneError::DumpIo("unexpected end of dump".to_string()))
    };
    let tag = next_line()?;
    let layout = match tag.trim() {
        "dense" => DumpLayout::Dense,
        "list" => DumpLayout::List,
        other => {
            return Err(TneError::DumpIo(format!("unknown dump layout `{other}`")));
        }
    };
    let name = next_line()?.trim().to_string();
    let parse_u64_line = |line: String| -> Result<Vec<u64>, TneError> {
        line.split_whitespace()
            .map(|token| {
                token
                    .parse::<u64>()
                    .map_err(|_| TneError::DumpIo(format!("malformed integer `{token}`")))
            })
            .collect()
    };
    let shape = parse_u64_line(next_line()?)?;
    let offsets = parse_u64_line(next_line()?)?;
    if shape.len() != offsets.len() {
        return Err(TneError::DumpIo(
            "shape and offset lines differ in length".to_string(),
        ));
    }
    let volume: u64 = shape.iter().product();
    let mut elements = vec![Complex64::new(0.0, 0.0); volume as usize];
    match layout {
        DumpLayout::Dense => {
            let mut cursor = 0usize;
            for line in lines {
                for token in line?.split_whitespace() {
                    if cursor >= elements.len() {
                        return Err(TneError::DumpIo("too many elements".to_string()));
                    }
                    elements[cursor] = parse_value(token)?;
                    cursor += 1;
                }
            }
            if cursor != elements.len() {
                return Err(TneError::DumpIo(format!(
                    "expected {volume} elements, found {cursor}"
                )));
            }
        }
        DumpLayout::List => {
            for line in lines {
                let line = line?;
                let mut tokens = line.split_whitespace();
                let Some(first) = tokens.next() else {
                    continue;
                };
                let value = parse_value(first)?;
                let indices: Vec<u64> = tokens
                    .map(|token| {
                        token
                            .parse::<u64>()
                            .map_err(|_| TneError::DumpIo(format!("malformed index `{token}`")))
                    })
                    .collect::<Result<_, _>>()?;
                if indices.len() != shape.len() {
                    return Err(TneError::DumpIo(format!(
                        "index tuple `{line}` does not match rank {}",
                        shape.len()
                    )));
                }
                // Column-major linearization, leftmost index fastest.
                let mut linear = 0u64;
                let mut stride = 1u64;
                for (index, extent) in indices.iter().zip(shape.iter()) {
                    if index >= extent {
                        return Err(TneError::DumpIo(format!("index {index} out of range")));
                    }
                    linear += index * stride;
                    stride *= extent;
                }
                elements[linear as usize] = value;
            }
        }
    }
    Ok(TensorDump {
        name,
        shape,
        offsets,
        elements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TensorDump {
        TensorDump {
            name: "T".to_string(),
            shape: vec![2, 3],
            offsets: vec![0, 4],
            elements: vec![
                Complex64::new(1.0, 0.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(0.0, -2.5),
                Complex64::new(3.0, 0.0),
                Complex64::new(0.0, 0.0),
                Complex64::new(4.0, 1.0),
            ],
        }
    }

    #[test]
    fn test_dense_round_trip() {
        let dump = sample();
        let mut buffer = Vec::new();
        write_dump(&mut buffer, &dump, DumpLayout::Dense, true).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert!(text.starts_with("dense\nT\n2 3\n0 4\n"));
        let read = read_dump(&buffer[..]).unwrap();
        assert_eq!(read, dump);
    }

    #[test]
    fn test_list_round_trip_skips_zeros() {
        let dump = sample();
        let mut buffer = Vec::new();
        write_dump(&mut buffer, &dump, DumpLayout::List, true).unwrap();
        let text = String::from_utf8(buffer.clone()).unwrap();
        // Four nonzeros, one line each after the four header lines.
        assert_eq!(text.lines().count(), 4 + 4);
        assert!(text.contains("(0,-2.5) 0 1"));
        let read = read_dump(&buffer[..]).unwrap();
        assert_eq!(read, dump);
    }

    #[test]
    fn test_real_notation_and_any_whitespace() {
        let text = "dense\nv\n4\n0\n1 2\n3\n4\n";
        let read = read_dump(text.as_bytes()).unwrap();
        assert_eq!(read.shape, vec![4]);
        assert_eq!(
            read.elements,
            (1..=4)
                .map(|v| Complex64::new(f64::from(v), 0.0))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_rank_zero_dump() {
        let dump = TensorDump {
            name: "s".to_string(),
            shape: vec![],
            offsets: vec![],
            elements: vec![Complex64::new(7.0, 0.0)],
        };
        let mut buffer = Vec::new();
        write_dump(&mut buffer, &dump, DumpLayout::Dense, false).unwrap();
        let read = read_dump(&buffer[..]).unwrap();
        assert_eq!(read, dump);
    }

    #[test]
    fn test_malformed_dump_rejected() {
        assert!(read_dump("dense\nT\n2\n0\n1\n".as_bytes()).is_err());
        assert!(read_dump("sparse\nT\n2\n0\n1 2\n".as_bytes()).is_err());
        assert!(read_dump("list\nT\n2\n0\n1 5\n".as_bytes()).is_err());
    }
}
