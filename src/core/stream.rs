use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;

use crate::core::types::Tokenizer;

/// Receives the validated text fragments of a turn while it is generated.
pub trait TurnSink {
    /// Returning false ends the turn as cancelled.
    fn fragment(&mut self, text: &str) -> bool;

    /// Polled between generation steps, never during an engine evaluation.
    fn cancelled(&self) -> bool {
        false
    }
}

pub(crate) struct Discard;

impl TurnSink for Discard {
    fn fragment(&mut self, _text: &str) -> bool {
        true
    }
}

impl TurnSink for SyncSender<String> {
    fn fragment(&mut self, text: &str) -> bool {
        self.send(text.to_string()).is_ok()
    }
}

/// Producer half of a [`stream_channel`].
pub struct StreamSender {
    tx: SyncSender<String>,
    cancel: Arc<AtomicBool>
}

/// Consumer half of a [`stream_channel`]. Iterates fragments until the turn ends.
/// Dropping it, or calling [`cancel`](Self::cancel), stops the producer at its next step,
/// including a producer blocked on a full channel.
pub struct StreamReceiver {
    rx: Option<Receiver<String>>,  // None once cancelled
    cancel: Arc<AtomicBool>
}

/// Bounded fragment channel; a full channel blocks the producer between steps.
pub fn stream_channel(capacity: usize) -> (StreamSender, StreamReceiver) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let cancel = Arc::new(AtomicBool::new(false));
    (
        StreamSender { tx, cancel: Arc::clone(&cancel) },
        StreamReceiver { rx: Some(rx), cancel },
    )
}

impl TurnSink for StreamSender {
    fn fragment(&mut self, text: &str) -> bool {
        !self.cancelled() && self.tx.send(text.to_string()).is_ok()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

impl StreamReceiver {
    /// Ends the turn. Fragments not read yet are discarded and iteration stops.
    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Release);
        // closing our half fails a send the producer may be blocked in
        self.rx = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.is_none()
    }
}

impl Iterator for StreamReceiver {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// True when `bytes` ends inside a multi-byte sequence that more bytes could complete.
fn ends_mid_codepoint(bytes: &[u8]) -> bool {
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(_) => return false,
            Err(e) => match e.error_len() {
                None => return true,
                Some(len) => rest = &rest[e.valid_up_to() + len..],
            },
        }
    }
}

/// Position and text of the first configured stop sequence found in `text[from..]`.
/// `from` is moved back to a char boundary.
pub fn find_stop<'s>(text: &str, from: usize, stops: &'s [String]) -> Option<(usize, &'s str)> {
    let mut from = from.min(text.len());
    while !text.is_char_boundary(from) {
        from -= 1;
    }
    stops.iter().find_map(|stop| {
        text[from..].find(stop.as_str()).map(|at| (from + at, stop.as_str()))
    })
}

/// Length of the longest tail of `text` that is a proper prefix of some stop sequence.
fn pending_stop_prefix(text: &str, stops: &[String]) -> usize {
    let bytes = text.as_bytes();
    stops
        .iter()
        .filter_map(|stop| {
            (1..stop.len())
                .rev()
                .find(|&n| bytes.ends_with(&stop.as_bytes()[..n]))
        })
        .max()
        .unwrap_or(0)
}

/// Builds the output of one generation from sampled tokens.
///
/// Tokens are decoded incrementally from the last emitted one; a fragment that ends
/// mid-codepoint is held until later tokens complete it. Stop sequences are searched
/// in the joined text, so they are found even when split across fragments.
pub struct PieceAssembler<'a> {
    tokenizer: &'a Tokenizer,
    stops: &'a [String],
    max_stop_len: usize,
    tokens: Vec<usize>,
    out_last: usize,        // first token not yet part of a piece
    text: String,           // all pieces so far
    streamed: usize,        // bytes of `text` handed to take_streamable
    stop: Option<(usize, &'a str)>
}

impl<'a> PieceAssembler<'a> {
    pub fn new(tokenizer: &'a Tokenizer, stops: &'a [String]) -> Self {
        PieceAssembler {
            tokenizer,
            stops,
            max_stop_len: stops.iter().map(String::len).max().unwrap_or(0),
            tokens: Vec::new(),
            out_last: 0,
            text: String::new(),
            streamed: 0,
            stop: None
        }
    }

    /// Records a sampled token and returns the piece it completes, if any.
    pub fn push(&mut self, token: usize) -> Option<String> {
        self.tokens.push(token);
        let bytes = self.tokenizer.decode(&self.tokens[self.out_last..]);
        if ends_mid_codepoint(&bytes) {
            return None;
        }
        let piece = String::from_utf8_lossy(&bytes).into_owned();
        self.out_last = self.tokens.len();

        let searched = self.text.len();
        self.text.push_str(&piece);
        if self.stop.is_none() {
            let from = (searched + 1).saturating_sub(self.max_stop_len);
            self.stop = find_stop(&self.text, from, self.stops);
        }
        Some(piece)
    }

    pub fn stop_sequence(&self) -> Option<&'a str> {
        self.stop.map(|(_, stop)| stop)
    }

    /// Text that can be shown now without ever having to be taken back: everything
    /// before a found stop sequence, or everything except a tail that may still turn
    /// into one.
    pub fn take_streamable(&mut self) -> Option<String> {
        let end = match self.stop {
            Some((at, _)) => at,
            None => self.text.len() - pending_stop_prefix(&self.text, self.stops),
        };
        self.take_until(end)
    }

    /// Whatever is left once generation ended without a stop sequence.
    pub fn take_rest(&mut self) -> Option<String> {
        let end = self.stop.map_or(self.text.len(), |(at, _)| at);
        self.take_until(end)
    }

    fn take_until(&mut self, end: usize) -> Option<String> {
        if end <= self.streamed {
            return None;
        }
        let fragment = self.text[self.streamed..end].to_string();
        self.streamed = end;
        Some(fragment)
    }

    /// Final text with the stop sequence and anything after it cut off, plus every token.
    pub fn finish(mut self) -> (String, Vec<usize>) {
        if let Some((at, _)) = self.stop {
            self.text.truncate(at);
        }
        (self.text, self.tokens)
    }
}
