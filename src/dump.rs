//! The dump manifest format: a streaming text parser that builds a
//! [`Tree`], and a canonicalizing writer that serializes one back out.
//!
//! Grounded on `original_source/tools/mkcomposefs.c`'s `tree_from_dump*`
//! family: records are read in chunks, split on raw (unescaped) spaces
//! and newlines, and hardlinks are resolved in a second pass once every
//! path in the dump has been seen once.

use std::io::{Read, Write};

use crate::error::{CfsError, ParseError, Result};
use crate::escape;
use crate::tree::{lossy, NodeId, Timestamp, Tree};

const CHUNK_SIZE: usize = 64 * 1024;

/// Parse a dump manifest into a fully resolved [`Tree`].
///
/// Reads `input` in chunks of at least [`CHUNK_SIZE`] bytes, reusing one
/// growable buffer across the whole stream rather than allocating per
/// record. A trailing record without a final newline is still parsed.
pub fn parse<R: Read>(input: &mut R) -> std::result::Result<Tree, ParseError> {
    let mut tree = Tree::new_root();
    let mut state = ParseState::default();

    let mut buf: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
    let mut start = 0usize;

    loop {
        if start > 0 {
            buf.drain(0..start);
            start = 0;
        }

        let old_len = buf.len();
        buf.resize(old_len + CHUNK_SIZE, 0);
        let n = read_some(input, &mut buf[old_len..]).map_err(|e| ParseError {
            record: state.record_no + 1,
            source: CfsError::Io(e),
        })?;
        buf.truncate(old_len + n);

        loop {
            let Some(nl) = buf[start..].iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_end = start + nl;
            if line_end > start {
                state.record_no += 1;
                let line = &buf[start..line_end];
                // Work around the borrow checker: parse_record needs
                // `&mut tree` and `&mut state` but `line` borrows `buf`.
                let line = line.to_vec();
                parse_record(&mut tree, &mut state, &line).map_err(|source| ParseError {
                    record: state.record_no,
                    source,
                })?;
            }
            start = line_end + 1;
        }

        if n == 0 {
            if start < buf.len() {
                state.record_no += 1;
                let line = buf[start..].to_vec();
                parse_record(&mut tree, &mut state, &line).map_err(|source| ParseError {
                    record: state.record_no,
                    source,
                })?;
            }
            break;
        }
    }

    resolve_hardlinks(&mut tree, &state).map_err(|source| ParseError {
        record: state.record_no,
        source,
    })?;

    Ok(tree)
}

fn read_some<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    // `Read::read` may return short reads for reasons unrelated to EOF
    // (a pipe with less than a full chunk ready, say); keep pulling
    // until the buffer is full or the source is actually exhausted.
    let mut total = 0;
    while total < buf.len() {
        match input.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

#[derive(Default)]
struct ParseState {
    record_no: u64,
    root_defined: bool,
    /// (hardlink node, decoded target path) pairs, resolved after every
    /// record has been parsed so forward references work.
    fixups: Vec<(NodeId, String)>,
}

/// Split `line` on a single unescaped space, consuming the separator.
/// Returns the field before the first space, or the whole remainder if
/// there is none.
fn split_field<'a>(line: &mut &'a [u8]) -> &'a [u8] {
    match line.iter().position(|&b| b == b' ') {
        Some(p) => {
            let field = &line[..p];
            *line = &line[p + 1..];
            field
        }
        None => std::mem::take(line),
    }
}

fn parse_uint(field: &[u8], radix: u32) -> Result<u64> {
    let s = std::str::from_utf8(field).map_err(|_| CfsError::InvalidInteger(lossy(field)))?;
    if s.is_empty() || !s.bytes().all(|b| (b as char).is_digit(radix)) {
        return Err(CfsError::InvalidInteger(s.to_string()));
    }
    u64::from_str_radix(s, radix).map_err(|_| CfsError::InvalidInteger(s.to_string()))
}

fn parse_mtime(field: &[u8]) -> Result<Timestamp> {
    let s = std::str::from_utf8(field).map_err(|_| CfsError::InvalidMtime(lossy(field)))?;
    let (sec_s, nsec_s) = s
        .split_once('.')
        .ok_or_else(|| CfsError::InvalidMtime(s.to_string()))?;
    let sec = parse_uint(sec_s.as_bytes(), 10).map_err(|_| CfsError::InvalidMtime(s.to_string()))?;
    let nsec =
        parse_uint(nsec_s.as_bytes(), 10).map_err(|_| CfsError::InvalidMtime(s.to_string()))?;
    Ok(Timestamp { sec, nsec })
}

fn parse_xattr(tree: &mut Tree, node: NodeId, token: &[u8]) -> Result<()> {
    let (key_raw, value_raw) = match token.iter().position(|&b| b == b'=') {
        Some(p) => (&token[..p], &token[p + 1..]),
        None => (token, &token[token.len()..]),
    };
    let key = escape::decode(key_raw)?;
    let value = escape::decode(value_raw)?;
    tree.node_mut(node).set_xattr(key, value)
}

fn parse_record(tree: &mut Tree, state: &mut ParseState, line: &[u8]) -> Result<()> {
    let mut rest = line;
    let mut fixed = [&[][..]; 11];
    for slot in fixed.iter_mut() {
        *slot = split_field(&mut rest);
    }
    let [path_f, size_f, mode_f, nlink_f, uid_f, gid_f, rdev_f, mtime_f, payload_f, content_f, digest_f] =
        fixed;

    let path = escape::decode(path_f)?;

    let is_hardlink = mode_f.first() == Some(&b'@');
    let mode_f = if is_hardlink { &mode_f[1..] } else { mode_f };
    let mode = parse_uint(mode_f, 8)? as u32;

    let node = if path == b"/" {
        if state.root_defined {
            return Err(CfsError::MultipleRoots);
        }
        let root = tree.root_id();
        tree.node_mut(root).mode = mode;
        if !tree.node(root).kind().is_directory() {
            return Err(CfsError::RootNotDirectory);
        }
        state.root_defined = true;
        root
    } else {
        let (parent, name) = tree.lookup_parent_path(&path)?;
        let node = tree.new_node();
        tree.node_mut(node).mode = mode;
        tree.add_child(parent, node, name.to_vec())?;
        node
    };

    if is_hardlink {
        if tree.node(node).kind().is_directory() {
            return Err(CfsError::HardlinkIsDir);
        }
        let target = escape::decode_optional(payload_f)?
            .ok_or_else(|| CfsError::DanglingHardlink(String::new()))?;
        let target = String::from_utf8(target).map_err(|_| CfsError::MalformedEscape)?;
        state.fixups.push((node, target));
        return Ok(());
    }

    let size = parse_uint(size_f, 10)?;
    let nlink = parse_uint(nlink_f, 10)? as u32;
    let uid = parse_uint(uid_f, 10)? as u32;
    let gid = parse_uint(gid_f, 10)? as u32;
    let rdev = parse_uint(rdev_f, 10)? as u32;
    let mtime = parse_mtime(mtime_f)?;
    let payload = escape::decode_optional(payload_f)?
        .map(|b| String::from_utf8(b).map_err(|_| CfsError::MalformedEscape))
        .transpose()?;
    let content = escape::decode_optional(content_f)?;
    let digest = escape::decode_optional(digest_f)?
        .map(|hex| {
            let raw = escape::hex_decode_digest(&hex)?;
            let arr: [u8; 32] = raw
                .try_into()
                .map_err(|_| CfsError::InvalidHexDigest)?;
            Ok::<_, CfsError>(arr)
        })
        .transpose()?;

    {
        let n = tree.node_mut(node);
        n.size = size;
        n.nlink = nlink;
        n.uid = uid;
        n.gid = gid;
        n.rdev = rdev;
        n.mtime = mtime;
        n.payload = payload;
        n.digest = digest;
    }
    if let Some(content) = content {
        tree.node_mut(node).set_content(content)?;
    }

    while !rest.is_empty() {
        let token = split_field(&mut rest);
        if !token.is_empty() {
            parse_xattr(tree, node, token)?;
        }
    }

    Ok(())
}

fn resolve_hardlinks(tree: &mut Tree, state: &ParseState) -> Result<()> {
    for (node, target_path) in &state.fixups {
        let target = tree
            .lookup_path(target_path.as_bytes())
            .ok_or_else(|| CfsError::DanglingHardlink(target_path.clone()))?;
        let saved_nlink = tree.node(target).nlink;
        tree.make_hardlink(*node, target)?;
        tree.node_mut(target).nlink = saved_nlink;
    }
    Ok(())
}

/// Write `tree` back out as dump manifest text, in depth-first order.
/// Xattrs are emitted sorted by key so output is reproducible regardless
/// of the arena's hash-map iteration order.
pub fn serialize<W: Write>(tree: &Tree, out: &mut W) -> std::io::Result<()> {
    for id in tree.walk() {
        let node = tree.node(id);
        let path = tree.path_of(id);

        write!(out, "{} ", escape::encode(&path))?;

        if node.is_hardlink() {
            let target = tree.resolve(id);
            let target_path = tree.path_of(target);
            writeln!(
                out,
                "0 @{:o} 0 0 0 0 0.0 {} - -",
                node.mode,
                escape::encode(&target_path)
            )?;
            continue;
        }

        write!(
            out,
            "{} {:o} {} {} {} {} {}.{} ",
            node.size, node.mode, node.nlink, node.uid, node.gid, node.rdev, node.mtime.sec,
            node.mtime.nsec
        )?;
        write!(out, "{} ", escape::encode_optional(node.payload.as_deref().map(str::as_bytes)))?;
        write!(out, "{} ", escape::encode_optional(node.content.as_deref()))?;
        write!(
            out,
            "{}",
            node.digest
                .map(|d| escape::hex_encode_digest(&d))
                .unwrap_or_else(|| "-".to_string())
        )?;

        let mut keys: Vec<&Vec<u8>> = node.xattrs.keys().collect();
        keys.sort();
        for key in keys {
            let value = &node.xattrs[key];
            write!(out, " {}={}", escape::encode(key), escape::encode(value))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse_str(s: &str) -> Tree {
        parse(&mut s.as_bytes()).unwrap()
    }

    #[test]
    fn minimal_root_only() {
        let tree = parse_str("/ 0 40755 2 0 0 0 0.0 - - -\n");
        let root = tree.root_id();
        assert!(tree.node(root).kind().is_directory());
        assert_eq!(tree.node(root).uid, 0);
    }

    #[test]
    fn file_under_root_with_content() {
        let tree = parse_str(
            "/ 0 40755 2 0 0 0 0.0 - - -\n\
             /a 5 100644 1 0 0 0 0.0 - hello -\n",
        );
        let a = tree.lookup_path(b"/a").unwrap();
        assert_eq!(tree.node(a).content.as_deref(), Some(b"hello".as_slice()));
        assert_eq!(tree.node(a).size, 5);
    }

    #[test]
    fn hardlink_preserves_target_nlink() {
        let tree = parse_str(
            "/ 0 40755 2 0 0 0 0.0 - - -\n\
             /a 5 100644 1 0 0 0 0.0 - hello -\n\
             /b 0 @100644 1 0 0 0 0.0 /a - -\n",
        );
        let a = tree.lookup_path(b"/a").unwrap();
        let b = tree.lookup_path(b"/b").unwrap();
        assert!(tree.node(b).is_hardlink());
        assert_eq!(tree.resolve(b), a);
        assert_eq!(tree.node(a).nlink, 1);
    }

    #[test]
    fn forward_hardlink_reference_resolves() {
        let tree = parse_str(
            "/ 0 40755 2 0 0 0 0.0 - - -\n\
             /b 0 @100644 1 0 0 0 0.0 /a - -\n\
             /a 5 100644 1 0 0 0 0.0 - hello -\n",
        );
        let a = tree.lookup_path(b"/a").unwrap();
        let b = tree.lookup_path(b"/b").unwrap();
        assert_eq!(tree.resolve(b), a);
    }

    #[test]
    fn dangling_hardlink_fails() {
        let err = parse(
            &mut "/ 0 40755 1 0 0 0 0.0 - - -\n/b 0 @100644 1 0 0 0 0.0 /nope - -\n".as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err.source, CfsError::DanglingHardlink(_)));
    }

    #[test]
    fn hardlink_onto_directory_fails() {
        let err = parse(
            &mut "/ 0 40755 1 0 0 0 0.0 - - -\n/d 0 @40755 1 0 0 0 0.0 / - -\n".as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err.source, CfsError::HardlinkIsDir));
    }

    #[test]
    fn second_root_fails() {
        let err =
            parse(&mut "/ 0 40755 1 0 0 0 0.0 - - -\n/ 0 40755 1 0 0 0 0.0 - - -\n".as_bytes())
                .unwrap_err();
        assert!(matches!(err.source, CfsError::MultipleRoots));
    }

    #[test]
    fn missing_parent_fails() {
        let err = parse(&mut "/a/b 0 100644 1 0 0 0 0.0 - - -\n".as_bytes()).unwrap_err();
        assert!(matches!(err.source, CfsError::MissingParent(_)));
    }

    #[test]
    fn zero_is_a_valid_integer() {
        let tree = parse_str("/ 0 40755 0 0 0 0 0.0 - - -\n");
        assert_eq!(tree.node(tree.root_id()).nlink, 0);
    }

    #[test]
    fn empty_integer_field_fails() {
        let err = parse(&mut "/  40755 1 0 0 0 0.0 - - -\n".as_bytes()).unwrap_err();
        assert!(matches!(err.source, CfsError::InvalidInteger(_)));
    }

    #[test]
    fn xattrs_round_trip() {
        let tree = parse_str("/ 0 40755 1 0 0 0 0.0 - - - user.foo=bar\n");
        let root = tree.root_id();
        assert_eq!(tree.node(root).xattrs.get(b"user.foo".as_slice()), Some(&b"bar".to_vec()));
    }

    #[test]
    fn no_trailing_newline_on_last_record() {
        let tree = parse_str("/ 0 40755 1 0 0 0 0.0 - - -");
        assert!(tree.node(tree.root_id()).kind().is_directory());
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let original = parse_str(
            "/ 0 40755 2 0 0 0 0.0 - - - user.x=1\n\
             /a 5 100644 1 0 0 0 0.0 - hello -\n\
             /b 0 @100644 1 0 0 0 0.0 /a - -\n",
        );
        let mut out = Vec::new();
        serialize(&original, &mut out).unwrap();
        let reparsed = parse(&mut out.as_slice()).unwrap();

        let a1 = original.lookup_path(b"/a").unwrap();
        let a2 = reparsed.lookup_path(b"/a").unwrap();
        assert_eq!(original.node(a1).content, reparsed.node(a2).content);

        let b2 = reparsed.lookup_path(b"/b").unwrap();
        assert!(reparsed.node(b2).is_hardlink());
        assert_eq!(reparsed.resolve(b2), a2);
    }

    #[test]
    fn parses_from_a_reader_that_trickles_bytes() {
        // A reader that only ever hands back a few bytes per call, to
        // exercise the short-read-stitching in `read_some`.
        struct Trickle<'a>(&'a [u8]);
        impl<'a> Read for Trickle<'a> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = 3.min(buf.len()).min(self.0.len());
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }
        let data = b"/ 0 40755 1 0 0 0 0.0 - - -\n/a 5 100644 1 0 0 0 0.0 - hello -\n";
        let tree = parse(&mut Trickle(data)).unwrap();
        assert!(tree.lookup_path(b"/a").is_some());
    }
}
