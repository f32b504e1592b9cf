//! Symbolic tensor operation grammar.
//!
//! The textual form `LHS(i,j,…) [+]= RHS1(…) [* RHS2(…)] [* scalar]` maps
//! index letters to tensor dimensions: a letter used once denotes an open
//! dimension (it must reappear on the left-hand side), a letter used twice on
//! the right denotes a contraction. A `+` directly after a tensor name marks
//! complex conjugation. Whitespace is insignificant.

use num_complex::Complex64;

use crate::error::TneError;

/// One tensor factor of a symbolic specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicFactor {
    /// Tensor name.
    pub name: String,
    /// Whether the factor is complex-conjugated (`name+`).
    pub conjugated: bool,
    /// Index labels, one per dimension.
    pub indices: Vec<String>,
}

/// A parsed symbolic specification.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicSpec {
    /// Left-hand side (destination) factor.
    pub lhs: SymbolicFactor,
    /// Right-hand side tensor factors in textual order.
    pub rhs: Vec<SymbolicFactor>,
    /// Whether the assignment accumulates (`+=`) into the destination.
    pub accumulative: bool,
    /// Optional trailing scalar prefactor.
    pub scalar: Option<Complex64>,
}

/// Returns the `n`-th generated index label (`u0`, `u1`, …).
#[must_use]
pub fn index_label(n: usize) -> String {
    format!("u{n}")
}

fn emit_factor(out: &mut String, factor: &SymbolicFactor) {
    out.push_str(&factor.name);
    if factor.conjugated {
        out.push('+');
    }
    out.push('(');
    out.push_str(&factor.indices.join(","));
    out.push(')');
}

/// Emits an assignment `LHS(…) [+]= F1(…) * F2(…) * …`.
#[must_use]
pub fn emit_assignment(
    lhs: &SymbolicFactor,
    factors: &[SymbolicFactor],
    accumulative: bool,
) -> String {
    let mut text = String::new();
    emit_factor(&mut text, lhs);
    if accumulative {
        text.push('+');
    }
    text.push('=');
    for (i, factor) in factors.iter().enumerate() {
        if i > 0 {
            text.push('*');
        }
        emit_factor(&mut text, factor);
    }
    text
}

/// Emits the symbolic form of a network: `OUT(…)=T1(…)*T2(…)*…`.
#[must_use]
pub fn emit_network(output: &SymbolicFactor, factors: &[SymbolicFactor]) -> String {
    emit_assignment(output, factors, false)
}

/// Generates an accumulative addition pattern `D(u0,…)+=R(u0,…)` of the given
/// rank, optionally conjugating the right-hand tensor.
#[must_use]
pub fn addition_pattern(rank: usize, lhs: &str, rhs: &str, conjugated: bool) -> String {
    let indices: Vec<String> = (0..rank).map(index_label).collect();
    let mut text = String::new();
    emit_factor(
        &mut text,
        &SymbolicFactor {
            name: lhs.to_string(),
            conjugated: false,
            indices: indices.clone(),
        },
    );
    text.push_str("+=");
    emit_factor(
        &mut text,
        &SymbolicFactor {
            name: rhs.to_string(),
            conjugated,
            indices,
        },
    );
    text
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn invalid(text: &str, reason: impl Into<String>) -> TneError {
    TneError::InvalidSymbolic(text.to_string(), reason.into())
}

fn parse_factor(original: &str, token: &str) -> Result<SymbolicFactor, TneError> {
    let open = token
        .find('(')
        .ok_or_else(|| invalid(original, format!("factor `{token}` lacks an index list")))?;
    if !token.ends_with(')') {
        return Err(invalid(original, format!("factor `{token}` lacks a closing parenthesis")));
    }
    let mut name = &token[..open];
    let conjugated = name.ends_with('+');
    if conjugated {
        name = &name[..name.len() - 1];
    }
    if name.is_empty()
        || !name.starts_with(is_ident_start)
        || !name.chars().all(is_ident)
    {
        return Err(invalid(original, format!("invalid tensor name `{name}`")));
    }
    let index_list = &token[open + 1..token.len() - 1];
    let indices = if index_list.is_empty() {
        Vec::new()
    } else {
        index_list
            .split(',')
            .map(|index| {
                if !index.starts_with(is_ident_start) || !index.chars().all(is_ident) {
                    Err(invalid(original, format!("invalid index `{index}`")))
                } else {
                    Ok(index.to_string())
                }
            })
            .collect::<Result<_, _>>()?
    };
    Ok(SymbolicFactor {
        name: name.to_string(),
        conjugated,
        indices,
    })
}

fn parse_scalar(token: &str) -> Option<Complex64> {
    if let Ok(real) = token.parse::<f64>() {
        return Some(Complex64::new(real, 0.0));
    }
    let inner = token.strip_prefix('(')?.strip_suffix(')')?;
    let (re, im) = inner.split_once(',')?;
    Some(Complex64::new(
        re.parse::<f64>().ok()?,
        im.parse::<f64>().ok()?,
    ))
}

/// Parses a symbolic specification. See the module docs for the grammar.
///
/// # Examples
/// ```
/// # use tne::symbolic::parse_spec;
/// let spec = parse_spec("D(a,b) += L+(a,i) * R(i,b) * 0.5").unwrap();
/// assert!(spec.accumulative);
/// assert_eq!(spec.rhs.len(), 2);
/// assert!(spec.rhs[0].conjugated);
/// assert_eq!(spec.scalar.unwrap().re, 0.5);
/// ```
pub fn parse_spec(text: &str) -> Result<SymbolicSpec, TneError> {
    let stripped: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let eq = stripped
        .find('=')
        .ok_or_else(|| invalid(text, "missing `=`"))?;
    let (mut lhs_text, rhs_text) = (&stripped[..eq], &stripped[eq + 1..]);
    let accumulative = lhs_text.ends_with('+');
    if accumulative {
        lhs_text = &lhs_text[..lhs_text.len() - 1];
    }
    let lhs = parse_factor(text, lhs_text)?;
    if lhs.conjugated {
        return Err(invalid(text, "the destination cannot be conjugated"));
    }

    let mut rhs = Vec::new();
    let mut scalar = None;
    for token in rhs_text.split('*') {
        if token.is_empty() {
            return Err(invalid(text, "empty factor"));
        }
        if scalar.is_some() {
            return Err(invalid(text, "the scalar must be the trailing factor"));
        }
        if token.starts_with(is_ident_start) && token.contains('(') {
            rhs.push(parse_factor(text, token)?);
        } else if let Some(value) = parse_scalar(token) {
            scalar = Some(value);
        } else {
            return Err(invalid(text, format!("unrecognized factor `{token}`")));
        }
    }
    if rhs.is_empty() {
        return Err(invalid(text, "no tensor factors on the right-hand side"));
    }
    Ok(SymbolicSpec {
        lhs,
        rhs,
        accumulative,
        scalar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_contraction() {
        let spec = parse_spec("D(a,b)=L(a,i)*R(i,b)").unwrap();
        assert_eq!(spec.lhs.name, "D");
        assert_eq!(spec.lhs.indices, vec!["a", "b"]);
        assert!(!spec.accumulative);
        assert_eq!(spec.rhs[1].name, "R");
        assert_eq!(spec.scalar, None);
    }

    #[test]
    fn test_parse_whitespace_insensitive() {
        let a = parse_spec("D(a,b)=L(a,i)*R(i,b)").unwrap();
        let b = parse_spec("  D( a, b )  =  L(a , i) * R( i,b ) ").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_scalar_forms() {
        let spec = parse_spec("S()+=U(i)*V(i)*2.5").unwrap();
        assert!(spec.accumulative);
        assert_eq!(spec.scalar, Some(Complex64::new(2.5, 0.0)));
        let spec = parse_spec("S()=U(i)*V(i)*(0.5,-1)").unwrap();
        assert_eq!(spec.scalar, Some(Complex64::new(0.5, -1.0)));
    }

    #[test]
    fn test_parse_conjugation() {
        let spec = parse_spec("D(a)=T+(a,i)*T(i,a1)*W(a1)").unwrap();
        assert!(spec.rhs[0].conjugated);
        assert!(!spec.rhs[1].conjugated);
        assert_eq!(spec.rhs[1].indices, vec!["i", "a1"]);
    }

    #[test]
    fn test_parse_rank_zero() {
        let spec = parse_spec("S()=U(i)*V(i)").unwrap();
        assert!(spec.lhs.indices.is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_spec("D(a,b)").is_err());
        assert!(parse_spec("D(a,b)=").is_err());
        assert!(parse_spec("D(a,b)=L(a,").is_err());
        assert!(parse_spec("D+(a)=L(a)").is_err());
        assert!(parse_spec("D(a)=2.0*L(a)").is_err());
        assert!(parse_spec("D(a)=L(1a)").is_err());
    }

    #[test]
    fn test_emit_round_trip() {
        let spec = parse_spec("D(a,b)=L+(a,i)*R(i,b)").unwrap();
        let emitted = emit_network(&spec.lhs, &spec.rhs);
        assert_eq!(emitted, "D(a,b)=L+(a,i)*R(i,b)");
        assert_eq!(parse_spec(&emitted).unwrap(), spec);
    }

    #[test]
    fn test_addition_pattern() {
        assert_eq!(addition_pattern(2, "D", "G", false), "D(u0,u1)+=G(u0,u1)");
        assert_eq!(addition_pattern(0, "S", "T", true), "S()+=T+()");
    }
}
