//! `.torrent` metainfo: a bounded bencode reader and the piece/file layout it describes.

use anyhow::{anyhow, Context, Result};
use sha1::{Digest, Sha1};
use skiff_core::FileSpan;

#[derive(Debug, Clone)]
enum BVal {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BVal>),
    Dict(Vec<(Vec<u8>, BVal)>),
}

const MAX_BENCODE_DEPTH: usize = 100;
const MAX_BENCODE_SIZE: usize = 100 * 1024 * 1024;
const MAX_PATH_DEPTH: usize = 100;
const HASH_LEN: usize = 20;

fn get_dict_value<'a>(dict: &'a [(Vec<u8>, BVal)], key: &[u8]) -> Option<&'a BVal> {
    dict.iter().find(|(k, _)| k.as_slice() == key).map(|(_, v)| v)
}

fn get_int(dict: &[(Vec<u8>, BVal)], key: &[u8]) -> Option<i64> {
    get_dict_value(dict, key).and_then(|v| match v { BVal::Int(i) => Some(*i), _ => None })
}

fn get_bytes<'a>(dict: &'a [(Vec<u8>, BVal)], key: &[u8]) -> Option<&'a [u8]> {
    get_dict_value(dict, key).and_then(|v| match v { BVal::Bytes(b) => Some(b.as_slice()), _ => None })
}

fn parse_bencode_with_depth(input: &[u8], mut i: usize, depth: usize) -> Result<(BVal, usize)> {
    if depth > MAX_BENCODE_DEPTH {
        return Err(anyhow!("bencode nesting too deep (max {})", MAX_BENCODE_DEPTH));
    }
    if i >= input.len() {
        return Err(anyhow!("eof"));
    }
    match input[i] {
        b'i' => {
            i += 1;
            let start = i;
            let max_int_len = 20;
            while i < input.len() && input[i] != b'e' && i - start < max_int_len {
                i += 1;
            }
            if i >= input.len() || input[i] != b'e' {
                return Err(anyhow!("unterminated or oversized int"));
            }
            let n = std::str::from_utf8(&input[start..i])?.parse::<i64>()?;
            Ok((BVal::Int(n), i + 1))
        }
        b'l' => {
            i += 1;
            let mut items = Vec::new();
            const MAX_LIST_ITEMS: usize = 100000;
            while i < input.len() && input[i] != b'e' {
                if items.len() >= MAX_LIST_ITEMS {
                    return Err(anyhow!("list too large (max {} items)", MAX_LIST_ITEMS));
                }
                let (v, ni) = parse_bencode_with_depth(input, i, depth + 1)?;
                i = ni;
                items.push(v);
            }
            if i >= input.len() {
                return Err(anyhow!("unterminated list"));
            }
            Ok((BVal::List(items), i + 1))
        }
        b'd' => {
            i += 1;
            let mut items = Vec::new();
            const MAX_DICT_ITEMS: usize = 100000;
            while i < input.len() && input[i] != b'e' {
                if items.len() >= MAX_DICT_ITEMS {
                    return Err(anyhow!("dict too large (max {} items)", MAX_DICT_ITEMS));
                }
                let (key, v, _, ni) = parse_dict_entry(input, i, depth + 1)?;
                i = ni;
                items.push((key, v));
            }
            if i >= input.len() {
                return Err(anyhow!("unterminated dict"));
            }
            Ok((BVal::Dict(items), i + 1))
        }
        b'0'..=b'9' => {
            let start = i;
            let max_len_str = 10;
            while i < input.len() && input[i] != b':' && i - start < max_len_str {
                i += 1;
            }
            if i >= input.len() || input[i] != b':' {
                return Err(anyhow!("invalid bytes length"));
            }
            let len = std::str::from_utf8(&input[start..i])?.parse::<usize>()?;
            const MAX_BYTE_STRING_SIZE: usize = 10 * 1024 * 1024;
            if len > MAX_BYTE_STRING_SIZE {
                return Err(anyhow!("byte string too large (max {} bytes)", MAX_BYTE_STRING_SIZE));
            }
            i += 1;
            let end = i + len;
            if end > input.len() {
                return Err(anyhow!("bytes out of range"));
            }
            Ok((BVal::Bytes(input[i..end].to_vec()), end))
        }
        _ => Err(anyhow!("invalid bencode prefix")),
    }
}

/// One `key value` pair starting at `i`. Also returns where the value starts, so callers
/// can hash its exact encoding.
fn parse_dict_entry(input: &[u8], i: usize, depth: usize) -> Result<(Vec<u8>, BVal, usize, usize)> {
    let (k, value_start) = parse_bencode_with_depth(input, i, depth)?;
    let key = match k {
        BVal::Bytes(b) => b,
        _ => return Err(anyhow!("dict key is not bytes")),
    };
    let (v, end) = parse_bencode_with_depth(input, value_start, depth)?;
    Ok((key, v, value_start, end))
}

/// The parts of a metainfo file the local engine needs.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Lowercase hex SHA-1 of the bencoded info dictionary.
    pub info_hash: String,
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; HASH_LEN]>,
    /// Relative paths, laid out back to back in torrent order.
    pub files: Vec<FileSpan>,
    pub total_length: u64,
}

fn path_component(raw: &[u8]) -> Result<String> {
    let part = String::from_utf8_lossy(raw).to_string();
    if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\']) {
        return Err(anyhow!("unsafe path component in metainfo: {:?}", part));
    }
    Ok(part)
}

pub fn parse_metainfo(bytes: &[u8]) -> Result<Metainfo> {
    if bytes.len() > MAX_BENCODE_SIZE {
        return Err(anyhow!("bencode input too large (max {} bytes)", MAX_BENCODE_SIZE));
    }
    if bytes.first() != Some(&b'd') {
        return Err(anyhow!("torrent root is not a dict"));
    }

    let mut i = 1;
    let mut info = None;
    while i < bytes.len() && bytes[i] != b'e' {
        let (key, value, value_start, end) = parse_dict_entry(bytes, i, 1).context("bencode parse")?;
        if key == b"info" {
            if let BVal::Dict(d) = value {
                info = Some((d, &bytes[value_start..end]));
            }
        }
        i = end;
    }
    let (info, raw_info) = info.ok_or_else(|| anyhow!("missing info dict"))?;

    let info_hash = hex::encode(Sha1::digest(raw_info));

    let name = get_bytes(&info, b"name.utf-8")
        .or_else(|| get_bytes(&info, b"name"))
        .map(path_component)
        .transpose()?
        .ok_or_else(|| anyhow!("missing name"))?;

    let piece_length = get_int(&info, b"piece length")
        .filter(|n| *n > 0)
        .ok_or_else(|| anyhow!("missing or invalid piece length"))? as u64;

    let pieces = get_bytes(&info, b"pieces").ok_or_else(|| anyhow!("missing pieces"))?;
    if pieces.len() % HASH_LEN != 0 {
        return Err(anyhow!("pieces length is not a multiple of {}", HASH_LEN));
    }
    let piece_hashes: Vec<[u8; HASH_LEN]> = pieces
        .chunks_exact(HASH_LEN)
        .map(|c| {
            let mut h = [0u8; HASH_LEN];
            h.copy_from_slice(c);
            h
        })
        .collect();

    let mut files = Vec::new();
    let mut offset: u64 = 0;
    if let Some(len) = get_int(&info, b"length") {
        let length = len.max(0) as u64;
        files.push(FileSpan { path: name.clone(), offset, length });
        offset = length;
    } else if let Some(BVal::List(entries)) = get_dict_value(&info, b"files") {
        for entry in entries {
            let BVal::Dict(fd) = entry else {
                return Err(anyhow!("file entry is not a dict"));
            };
            let length = get_int(fd, b"length").unwrap_or(0).max(0) as u64;
            let parts = match get_dict_value(fd, b"path.utf-8").or_else(|| get_dict_value(fd, b"path")) {
                Some(BVal::List(parts)) if !parts.is_empty() && parts.len() <= MAX_PATH_DEPTH => parts,
                _ => return Err(anyhow!("file entry without a usable path")),
            };
            let mut path = name.clone();
            for part in parts {
                let BVal::Bytes(raw) = part else {
                    return Err(anyhow!("path component is not a string"));
                };
                path.push('/');
                path.push_str(&path_component(raw)?);
            }
            files.push(FileSpan { path, offset, length });
            offset = offset
                .checked_add(length)
                .ok_or_else(|| anyhow!("total content length overflows"))?;
        }
    } else {
        return Err(anyhow!("info dict has neither length nor files"));
    }

    let expected_pieces = offset.div_ceil(piece_length) as usize;
    if expected_pieces != piece_hashes.len() {
        return Err(anyhow!(
            "metainfo lists {} piece hashes, content needs {}",
            piece_hashes.len(),
            expected_pieces
        ));
    }

    Ok(Metainfo {
        info_hash,
        name,
        piece_length,
        piece_hashes,
        files,
        total_length: offset,
    })
}
