//! Reads `!<arch>` style archives. The whole member list is parsed up front with every member's
//! name already resolved: names end up in the output symbol table as STT_FILE entries and in
//! the map file, so there's nothing to gain from deferring them. We don't use the ar crate
//! because it only hands out data via the Read trait and we want to borrow each member's bytes
//! for the duration of the link.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context;

const MAGIC: &[u8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;

/// Every member header ends with this two-byte marker.
const HEADER_END: &[u8] = b"`\n";

/// The name field occupies the first 16 bytes of a header; the decimal size field sits at byte
/// 48 of 60.
const NAME_FIELD_LEN: usize = 16;
const SIZE_FIELD_OFFSET: usize = 48;
const SIZE_FIELD_LEN: usize = 10;

/// One object stored in an archive.
pub(crate) struct Member<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) data: &'data [u8],
}

/// What a header's name field says the member is.
enum MemberKind {
    /// The `/` member: an index of which members define which symbols. We read every object
    /// eagerly anyway, so the index has nothing to tell us.
    SymbolIndex,

    /// The `//` member: storage for names too long for the 16-byte name field.
    LongNames,

    Object,
}

/// Parses an archive and returns its object members in order. The bookkeeping members (symbol
/// index and long-name table) are consumed here and don't appear in the result.
pub(crate) fn parse_members(data: &[u8]) -> Result<Vec<Member>> {
    let Some(mut rest) = data.strip_prefix(MAGIC) else {
        bail!("Missing !<arch> magic");
    };
    let mut long_names: &[u8] = &[];
    let mut members = Vec::new();
    while !rest.is_empty() {
        if rest.len() < HEADER_LEN {
            bail!("Truncated member header");
        }
        let (header, body) = rest.split_at(HEADER_LEN);
        if &header[HEADER_LEN - HEADER_END.len()..] != HEADER_END {
            bail!("Malformed member header");
        }
        let name_field = &header[..NAME_FIELD_LEN];
        let size = parse_size(&header[SIZE_FIELD_OFFSET..SIZE_FIELD_OFFSET + SIZE_FIELD_LEN])?;
        if body.len() < size {
            bail!("Member is {size} bytes, but only {} remain", body.len());
        }
        let content = &body[..size];
        // Members are 2-byte aligned; a lone newline pads out odd sizes.
        let mut consumed = size;
        if consumed % 2 == 1 && consumed < body.len() {
            consumed += 1;
        }
        rest = &body[consumed..];
        match classify(name_field) {
            MemberKind::SymbolIndex => {}
            MemberKind::LongNames => long_names = content,
            MemberKind::Object => members.push(Member {
                name: resolve_name(name_field, long_names)?,
                data: content,
            }),
        }
    }
    Ok(members)
}

fn classify(name_field: &[u8]) -> MemberKind {
    match strip_trailing_spaces(name_field) {
        b"/" => MemberKind::SymbolIndex,
        b"//" => MemberKind::LongNames,
        _ => MemberKind::Object,
    }
}

/// Member names are either stored inline with a trailing `/`, or as `/offset` pointing into the
/// long-name table when they don't fit in the 16-byte field.
fn resolve_name<'data>(name_field: &'data [u8], long_names: &'data [u8]) -> Result<&'data [u8]> {
    let ident = strip_trailing_spaces(name_field);
    if let Some(digits) = ident.strip_prefix(b"/") {
        let offset: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .context("Invalid long-name reference")?;
        let table = long_names
            .get(offset..)
            .context("Long-name reference is out of range")?;
        let end = memchr::memchr2(b'/', b'\n', table).unwrap_or(table.len());
        return Ok(&table[..end]);
    }
    Ok(ident.strip_suffix(b"/").unwrap_or(ident))
}

fn strip_trailing_spaces(field: &[u8]) -> &[u8] {
    let end = field
        .iter()
        .rposition(|byte| *byte != b' ')
        .map(|i| i + 1)
        .unwrap_or(0);
    &field[..end]
}

fn parse_size(field: &[u8]) -> Result<usize> {
    let digits = strip_trailing_spaces(field);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        bail!("Invalid member size field");
    }
    Ok(digits
        .iter()
        .fold(0, |value, &digit| value * 10 + usize::from(digit - b'0')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(ident: &str, size: usize) -> Vec<u8> {
        let mut out = format!("{ident:<16}").into_bytes();
        out.extend_from_slice(b"0           ");
        out.extend_from_slice(b"0     ");
        out.extend_from_slice(b"0     ");
        out.extend_from_slice(b"644     ");
        out.extend_from_slice(format!("{size:<10}").as_bytes());
        out.extend_from_slice(HEADER_END);
        assert_eq!(out.len(), HEADER_LEN);
        out
    }

    fn build(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        for (ident, data) in entries {
            bytes.extend_from_slice(&header(ident, data.len()));
            bytes.extend_from_slice(data);
            if data.len() % 2 == 1 {
                bytes.push(b'\n');
            }
        }
        bytes
    }

    #[test]
    fn test_member_names_and_data() {
        let bytes = build(&[
            ("/", b"\0\0\0\0"),
            ("//", b"a_very_long_member_name.o/\n"),
            ("short.o/", b"short contents"),
            ("/0", b"long contents"),
        ]);
        let members = parse_members(&bytes).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, &b"short.o"[..]);
        assert_eq!(members[0].data, &b"short contents"[..]);
        assert_eq!(members[1].name, &b"a_very_long_member_name.o"[..]);
        assert_eq!(members[1].data, &b"long contents"[..]);
    }

    #[test]
    fn test_odd_sized_members_are_padded() {
        let bytes = build(&[("a.o/", b"odd"), ("b.o/", b"even")]);
        let members = parse_members(&bytes).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].data, &b"odd"[..]);
        assert_eq!(members[1].name, &b"b.o"[..]);
    }

    #[test]
    fn test_not_an_archive() {
        assert!(parse_members(b"not an archive").is_err());
    }

    #[test]
    fn test_truncated_member() {
        let mut bytes = build(&[("a.o/", b"contents")]);
        bytes.truncate(bytes.len() - 4);
        assert!(parse_members(&bytes).is_err());
    }

    #[test]
    fn test_bad_size_field() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&header("a.o/", 0));
        let start = MAGIC.len() + SIZE_FIELD_OFFSET;
        bytes[start..start + 3].copy_from_slice(b"abc");
        assert!(parse_members(&bytes).is_err());
    }
}
