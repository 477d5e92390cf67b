//! Declarative validation of message dictionaries.
//!
//! Every query handler describes the keys it needs as a table of
//! [`KeyDesc`] entries and gets back the extracted values positionally.
//! A descriptor can descend into a child dictionary (`PARSE_CHILDREN`);
//! the entry that closes the child scope carries `LAST_CHILD`. When an
//! optional child dictionary is absent, its whole descriptor range is
//! skipped and those slots stay `None`.

use crate::bencode::Value;

pub const OPTIONAL: u8 = 0x01;
pub const SIZE_DIVISIBLE: u8 = 0x02;
pub const PARSE_CHILDREN: u8 = 0x04;
pub const LAST_CHILD: u8 = 0x08;

const MAX_NESTING: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Int,
    Str,
    Dict,
    List,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyDesc {
    pub name: &'static str,
    pub kind: KeyKind,
    /// For `Str`: required byte length, or the grain when
    /// `SIZE_DIVISIBLE` is set. Zero means any length.
    pub size: usize,
    pub flags: u8,
}

impl KeyDesc {
    pub const fn new(name: &'static str, kind: KeyKind, size: usize, flags: u8) -> Self {
        Self {
            name,
            kind,
            size,
            flags,
        }
    }
}

fn kind_matches(value: &Value, kind: KeyKind) -> bool {
    matches!(
        (value, kind),
        (Value::Integer(_), KeyKind::Int)
            | (Value::Bytes(_), KeyKind::Str)
            | (Value::Dict(_), KeyKind::Dict)
            | (Value::List(_), KeyKind::List)
    )
}

/// Checks `msg` against `desc`, filling `out` with the values found.
///
/// `out` must be as long as `desc`. On failure the error text names the
/// offending key and is suitable for an error reply verbatim.
pub fn verify_message<'a>(
    msg: &'a Value,
    desc: &[KeyDesc],
    out: &mut [Option<&'a Value>],
) -> Result<(), String> {
    debug_assert_eq!(desc.len(), out.len());
    for slot in out.iter_mut() {
        *slot = None;
    }

    if msg.as_dict().is_none() {
        return Err("not a dictionary".to_string());
    }

    let mut stack: [&Value; MAX_NESTING] = [msg; MAX_NESTING];
    let mut depth = 0usize;
    let mut current = msg;

    let mut i = 0;
    while i < desc.len() {
        let k = &desc[i];

        let mut found = current
            .get(k.name.as_bytes())
            .filter(|v| kind_matches(v, k.kind));

        if found.is_none() && k.flags & OPTIONAL == 0 {
            return Err(format!("missing '{}' key", k.name));
        }

        if k.size > 0 && k.kind == KeyKind::Str {
            if let Some(v) = found {
                let len = v.as_bytes().map(|b| b.len()).unwrap_or(0);
                let invalid = if k.flags & SIZE_DIVISIBLE != 0 {
                    len % k.size != 0
                } else {
                    len != k.size
                };
                if invalid {
                    if k.flags & OPTIONAL == 0 {
                        return Err(format!("invalid value for '{}'", k.name));
                    }
                    found = None;
                }
            }
        }

        out[i] = found;

        if k.flags & PARSE_CHILDREN != 0 {
            match found {
                Some(child) => {
                    depth += 1;
                    debug_assert!(depth < MAX_NESTING);
                    stack[depth] = child;
                    current = child;
                }
                None => {
                    // skip the whole child scope, last-child entry included
                    while i < desc.len() && desc[i].flags & LAST_CHILD == 0 {
                        i += 1;
                    }
                }
            }
        } else if k.flags & LAST_CHILD != 0 {
            debug_assert!(depth > 0);
            depth -= 1;
            current = stack[depth];
        }

        i += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decode;

    const PING: &[KeyDesc] = &[
        KeyDesc::new("q", KeyKind::Str, 0, 0),
        KeyDesc::new("a", KeyKind::Dict, 0, 0),
    ];

    #[test]
    fn required_keys_found() {
        let msg = decode(b"d1:ad2:id2:abe1:q4:pinge").unwrap();
        let mut out = [None; 2];
        verify_message(&msg, PING, &mut out).unwrap();
        assert_eq!(out[0].and_then(|v| v.as_str()), Some("ping"));
        assert!(out[1].unwrap().as_dict().is_some());
    }

    #[test]
    fn missing_required_key() {
        let msg = decode(b"d1:q4:pinge").unwrap();
        let mut out = [None; 2];
        let err = verify_message(&msg, PING, &mut out).unwrap_err();
        assert_eq!(err, "missing 'a' key");
    }

    #[test]
    fn wrong_type_counts_as_missing() {
        let msg = decode(b"d1:ai1e1:q4:pinge").unwrap();
        let mut out = [None; 2];
        assert!(verify_message(&msg, PING, &mut out).is_err());
    }

    #[test]
    fn fixed_size_enforced() {
        let desc = &[KeyDesc::new("target", KeyKind::Str, 20, 0)];
        let msg = decode(b"d6:target5:shorte").unwrap();
        let mut out = [None; 1];
        let err = verify_message(&msg, desc, &mut out).unwrap_err();
        assert_eq!(err, "invalid value for 'target'");
    }

    #[test]
    fn divisible_size() {
        let desc = &[KeyDesc::new("next", KeyKind::Str, 2, SIZE_DIVISIBLE)];

        let msg = decode(b"d4:next4:aabbe").unwrap();
        let mut out = [None; 1];
        verify_message(&msg, desc, &mut out).unwrap();
        assert!(out[0].is_some());

        let msg = decode(b"d4:next3:aabe").unwrap();
        assert!(verify_message(&msg, desc, &mut out).is_err());
    }

    #[test]
    fn optional_size_mismatch_is_dropped() {
        let desc = &[KeyDesc::new("ip", KeyKind::Str, 4, OPTIONAL)];
        let msg = decode(b"d2:ip2:xxe").unwrap();
        let mut out = [None; 1];
        verify_message(&msg, desc, &mut out).unwrap();
        assert!(out[0].is_none());
    }

    const NESTED: &[KeyDesc] = &[
        KeyDesc::new("target", KeyKind::Str, 0, 0),
        KeyDesc::new("head", KeyKind::Dict, 0, OPTIONAL | PARSE_CHILDREN),
        KeyDesc::new("seq", KeyKind::Int, 0, 0),
        KeyDesc::new("key", KeyKind::Str, 0, LAST_CHILD),
        KeyDesc::new("tail", KeyKind::Str, 0, OPTIONAL),
    ];

    #[test]
    fn descends_into_children() {
        let msg = decode(b"d4:headd3:key2:kk3:seqi9ee6:target2:tt4:tail2:zze").unwrap();
        let mut out = [None; 5];
        verify_message(&msg, NESTED, &mut out).unwrap();
        assert_eq!(out[2].and_then(|v| v.as_integer()), Some(9));
        assert_eq!(out[3].and_then(|v| v.as_str()), Some("kk"));
        // after the child scope closes, lookups are back at the top level
        assert_eq!(out[4].and_then(|v| v.as_str()), Some("zz"));
    }

    #[test]
    fn absent_optional_child_skips_its_scope() {
        let msg = decode(b"d6:target2:tt4:tail2:zze").unwrap();
        let mut out = [None; 5];
        verify_message(&msg, NESTED, &mut out).unwrap();
        assert!(out[1].is_none());
        assert!(out[2].is_none());
        assert!(out[3].is_none());
        assert_eq!(out[4].and_then(|v| v.as_str()), Some("zz"));
    }

    #[test]
    fn missing_key_inside_child_fails() {
        let msg = decode(b"d4:headd3:key2:kke6:target2:tte").unwrap();
        let mut out = [None; 5];
        let err = verify_message(&msg, NESTED, &mut out).unwrap_err();
        assert_eq!(err, "missing 'seq' key");
    }

    #[test]
    fn non_dict_message() {
        let msg = decode(b"i1e").unwrap();
        let mut out = [None; 2];
        assert!(verify_message(&msg, PING, &mut out).is_err());
    }
}
