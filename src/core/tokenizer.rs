use std::fs;
use std::path::Path;
use std::str::Chars;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::core::error::{ChatError, Result};
use crate::core::types::{Tokenizer, Trie, TrieNode, Vocabulary};

const BUNDLED_VOCAB: &str = include_str!("../../assets/rwkv_vocab.txt");

/// Largest token id a dictionary may declare. RWKV world vocabularies stop at 65535.
pub const MAX_TOKEN_ID: usize = 1 << 20;

impl Trie {
    pub fn new() -> Self {
        Trie { nodes: vec![TrieNode::default()] }
    }

    fn child(&self, node: usize, byte: u8) -> Option<usize> {
        let children = &self.nodes[node].children;
        children
            .binary_search_by_key(&byte, |&(b, _)| b)
            .ok()
            .map(|i| children[i].1 as usize)
    }

    /// Adds `key` ending in `token`. A node keeps the first token inserted for it,
    /// later ones are ignored. Returns false when the node was already taken.
    pub fn insert(&mut self, key: &[u8], token: usize) -> bool {
        let mut node = 0;
        for &byte in key {
            node = match self.child(node, byte) {
                Some(next) => next,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(TrieNode::default());
                    let children = &mut self.nodes[node].children;
                    let at = children.partition_point(|&(b, _)| b < byte);
                    children.insert(at, (byte, next as u32));
                    next
                }
            };
        }
        match self.nodes[node].token {
            Some(_) => false,
            None => {
                self.nodes[node].token = Some(token);
                true
            }
        }
    }

    /// Longest token matching `bytes` from `start`, as (end offset, token id).
    pub fn find_longest(&self, bytes: &[u8], start: usize) -> Option<(usize, usize)> {
        let mut node = 0;
        let mut best = None;
        for (offset, &byte) in bytes[start..].iter().enumerate() {
            match self.child(node, byte) {
                Some(next) => node = next,
                None => break,
            }
            if let Some(token) = self.nodes[node].token {
                best = Some((start + offset + 1, token));
            }
        }
        best
    }
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

fn take_hex(chars: &mut Chars, digits: usize) -> std::result::Result<u32, String> {
    let mut value = 0u32;
    for _ in 0..digits {
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .ok_or_else(|| format!("expected {} hex digits", digits))?;
        value = value * 16 + digit;
    }
    Ok(value)
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// Decodes a quoted dictionary literal such as `'the'`, `"'s"` or `b'\xe4\xbd'`.
///
/// Inside a `b` literal `\xNN` is the raw byte NN. Inside a text literal it is
/// the code point U+00NN, so `'\xa0'` yields the two UTF-8 bytes of a no-break space.
pub(crate) fn parse_literal(literal: &str) -> std::result::Result<Vec<u8>, String> {
    let (binary, quoted) = match literal.strip_prefix('b') {
        Some(rest) => (true, rest),
        None => (false, literal),
    };
    let quote = match quoted.chars().next() {
        Some(q @ ('\'' | '"')) => q,
        _ => return Err(format!("literal {} is not quoted", literal)),
    };
    let body = quoted
        .strip_prefix(quote)
        .and_then(|rest| rest.strip_suffix(quote))
        .ok_or_else(|| format!("literal {} is not terminated", literal))?;

    let mut out = Vec::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            push_char(&mut out, c);
            continue;
        }
        let escaped = chars.next().ok_or("dangling backslash")?;
        match escaped {
            '\\' | '\'' | '"' => out.push(escaped as u8),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            '0' => out.push(0),
            'x' => {
                let value = take_hex(&mut chars, 2)?;
                if binary {
                    out.push(value as u8);
                } else {
                    // two hex digits always form a valid scalar value
                    push_char(&mut out, char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
            }
            'u' | 'U' if !binary => {
                let digits = if escaped == 'u' { 4 } else { 8 };
                let value = take_hex(&mut chars, digits)?;
                let c = char::from_u32(value)
                    .ok_or_else(|| format!("invalid code point U+{:X}", value))?;
                push_char(&mut out, c);
            }
            other => return Err(format!("unknown escape \\{}", other)),
        }
    }
    Ok(out)
}

/// Parses `<id> <literal> <byte length>`. The literal itself may contain spaces.
fn parse_line(line_no: usize, line: &str) -> Result<(usize, Vec<u8>)> {
    let (left, right) = match (line.find(' '), line.rfind(' ')) {
        (Some(left), Some(right)) if left < right => (left, right),
        _ => return Err(ChatError::corrupt(line_no, "expected `<id> <literal> <length>`")),
    };
    let id: usize = line[..left]
        .parse()
        .map_err(|e| ChatError::corrupt(line_no, format!("bad token id: {}", e)))?;
    let length: usize = line[right + 1..]
        .parse()
        .map_err(|e| ChatError::corrupt(line_no, format!("bad byte length: {}", e)))?;
    let bytes = parse_literal(&line[left + 1..right])
        .map_err(|reason| ChatError::corrupt(line_no, reason))?;

    if bytes.len() != length {
        return Err(ChatError::corrupt(
            line_no,
            format!("literal decodes to {} bytes, declared {}", bytes.len(), length),
        ));
    }
    Ok((id, bytes))
}

impl Vocabulary {
    /// Builds the vocabulary from (id, bytes) pairs, inserting them into the trie in order.
    ///
    /// Fails when an id repeats or exceeds [`MAX_TOKEN_ID`], a token is empty, or some
    /// byte value has no single-byte token (encoding could then get stuck). Errors
    /// report the 1-based position of the entry.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, Vec<u8>)>,
    {
        Self::build(
            entries
                .into_iter()
                .enumerate()
                .map(|(index, (id, bytes))| (index + 1, id, bytes)),
        )
    }

    fn build<I>(entries: I) -> Result<Self>
    where
        I: Iterator<Item = (usize, usize, Vec<u8>)>,
    {
        let mut pieces: Vec<Option<Box<[u8]>>> = Vec::new();
        let mut trie = Trie::new();
        let mut max_token_length = 0;
        let mut len = 0;

        for (line_no, id, bytes) in entries {
            if id > MAX_TOKEN_ID {
                return Err(ChatError::corrupt(
                    line_no,
                    format!("token id {} is above the limit of {}", id, MAX_TOKEN_ID),
                ));
            }
            if bytes.is_empty() {
                return Err(ChatError::corrupt(line_no, format!("token {} is empty", id)));
            }
            if pieces.len() <= id {
                pieces.resize(id + 1, None);
            }
            if pieces[id].is_some() {
                return Err(ChatError::corrupt(line_no, format!("token id {} defined twice", id)));
            }
            if !trie.insert(&bytes, id) {
                debug!(id, "token shadowed by an earlier one with the same bytes");
            }
            max_token_length = max_token_length.max(bytes.len());
            pieces[id] = Some(bytes.into_boxed_slice());
            len += 1;
        }

        if let Some(byte) = (0..=255u8).find(|&b| trie.find_longest(&[b], 0).is_none()) {
            return Err(ChatError::corrupt(0, format!("no token covers byte 0x{:02x}", byte)));
        }

        Ok(Vocabulary { pieces, trie, len, max_token_length })
    }

    /// Parses a whole dictionary text, one `<id> <literal> <length>` entry per line.
    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<(usize, &str)> = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        let entries = lines
            .par_iter()
            .map(|&(index, line)| parse_line(index + 1, line).map(|(id, bytes)| (index + 1, id, bytes)))
            .collect::<Result<Vec<_>>>()?;
        let vocab = Self::build(entries.into_iter())?;
        debug!(tokens = vocab.len, max_token_length = vocab.max_token_length, "vocabulary built");
        Ok(vocab)
    }

    /// Reads and parses a dictionary file such as `rwkv_vocab_v20230424.txt`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let vocab = Self::parse(&fs::read_to_string(path)?)?;
        info!(path = %path.display(), tokens = vocab.len, "vocabulary loaded");
        Ok(vocab)
    }

    /// The small sample dictionary shipped with the crate. Its ids are not those of any
    /// released model; use [`load`](Self::load) for a real vocabulary.
    pub fn bundled() -> Result<Self> {
        Self::parse(BUNDLED_VOCAB)
    }

    pub fn piece(&self, id: usize) -> Option<&[u8]> {
        self.pieces.get(id).and_then(|p| p.as_deref())
    }

    /// One past the largest token id.
    pub fn id_bound(&self) -> usize {
        self.pieces.len()
    }
}

impl Tokenizer {
    pub fn new(vocab: Arc<Vocabulary>) -> Self {
        Tokenizer { vocab }
    }

    pub fn bundled() -> Result<Self> {
        Ok(Self::new(Arc::new(Vocabulary::bundled()?)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(Vocabulary::load(path)?)))
    }

    pub fn encode(&self, text: &str) -> Vec<usize> {
        self.encode_bytes(text.as_bytes())
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> Vec<usize> {
        let mut tokens = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut pos = 0;
        while pos < bytes.len() {
            match self.vocab.trie.find_longest(bytes, pos) {
                Some((end, token)) => {
                    tokens.push(token);
                    pos = end;
                }
                None => {
                    // unreachable for vocabularies built through from_entries
                    warn!(byte = bytes[pos], "no token for byte, skipping");
                    pos += 1;
                }
            }
        }
        tokens
    }

    /// Concatenates token bytes. Unknown ids contribute nothing; the result may end
    /// in the middle of a UTF-8 sequence.
    pub fn decode(&self, tokens: &[usize]) -> Vec<u8> {
        tokens
            .iter()
            .filter_map(|&t| self.vocab.piece(t))
            .flatten()
            .copied()
            .collect()
    }

    /// Lossy text form of [`decode`](Self::decode); broken sequences become U+FFFD.
    pub fn decode_text(&self, tokens: &[usize]) -> String {
        String::from_utf8_lossy(&self.decode(tokens)).into_owned()
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len
    }
}
