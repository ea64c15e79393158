//! Streaming generation
//!
//! A generation call yields a lazy, finite sequence of text fragments. The
//! [`FragmentStream`] enforces the token budget and cooperative cancellation;
//! [`accumulate`] folds it into text, stopping at the first stop sequence.

use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};

use crate::backend::{FragmentSource, SamplingParams};

/// Input of one generation call
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Instruction placed after the image
    pub instruction: String,

    /// Encoded image bytes
    pub image: Vec<u8>,

    /// Sampling settings
    pub sampling: SamplingParams,
}

/// Budget- and cancellation-aware view over a [`FragmentSource`]
pub struct FragmentStream<'a> {
    source: Box<dyn FragmentSource + 'a>,
    remaining: usize,
    cancel: CancellationToken,
    finished: bool,
}

impl<'a> FragmentStream<'a> {
    pub fn new(source: Box<dyn FragmentSource + 'a>, max_fragments: usize, cancel: CancellationToken) -> Self {
        Self {
            source,
            remaining: max_fragments,
            cancel,
            finished: false,
        }
    }
}

impl Iterator for FragmentStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.cancel.is_cancelled() {
            self.finished = true;
            return Some(Err(Error::Cancelled));
        }

        if self.remaining == 0 {
            self.finished = true;
            return None;
        }

        match self.source.next_fragment() {
            Ok(Some(fragment)) => {
                self.remaining -= 1;
                Some(Ok(fragment))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Collects fragments until the stream ends or a stop sequence appears.
///
/// A stop sequence only ends generation once some text precedes it, so a
/// model that opens its turn with a control token is not cut off.
pub fn accumulate<I>(fragments: I, stop_sequences: &[&str]) -> Result<String>
where
    I: IntoIterator<Item = Result<String>>,
{
    let mut text = String::new();

    for fragment in fragments {
        text.push_str(&fragment?);

        if let Some(pos) = stop_position(&text, stop_sequences) {
            text.truncate(pos);
            break;
        }
    }

    Ok(text)
}

fn stop_position(text: &str, stop_sequences: &[&str]) -> Option<usize> {
    stop_sequences
        .iter()
        .filter(|stop| !stop.is_empty())
        .filter_map(|stop| {
            text.match_indices(stop)
                .map(|(pos, _)| pos)
                .find(|&pos| !text[..pos].trim().is_empty())
        })
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(std::vec::IntoIter<&'static str>);

    impl FragmentSource for Fixed {
        fn next_fragment(&mut self) -> Result<Option<String>> {
            Ok(self.0.next().map(str::to_string))
        }
    }

    fn stream(parts: Vec<&'static str>, budget: usize, cancel: CancellationToken) -> FragmentStream<'static> {
        FragmentStream::new(Box::new(Fixed(parts.into_iter())), budget, cancel)
    }

    #[test]
    fn test_stops_at_split_stop_sequence() {
        let parts = vec!["A cat", " on a mat", "<|im", "_end|>", "ignored"];
        let text = accumulate(stream(parts, 100, CancellationToken::new()), &["<|im_end|>"]).unwrap();
        assert_eq!(text, "A cat on a mat");
    }

    #[test]
    fn test_leading_control_token_does_not_stop() {
        let parts = vec!["<|im_start|>", "A red car", "<|im_end|>"];
        let text = accumulate(
            stream(parts, 100, CancellationToken::new()),
            &["<|im_end|>", "<|im_start|>"],
        )
        .unwrap();
        assert_eq!(text, "<|im_start|>A red car");
    }

    #[test]
    fn test_budget_limits_fragments() {
        let parts = vec!["one ", "two ", "three ", "four"];
        let text = accumulate(stream(parts, 2, CancellationToken::new()), &[]).unwrap();
        assert_eq!(text, "one two ");
    }

    #[test]
    fn test_cancellation_propagates() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = accumulate(stream(vec!["x"], 10, cancel), &[]).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_stream_is_not_restartable() {
        let mut s = stream(vec!["only"], 10, CancellationToken::new());
        assert_eq!(s.next().unwrap().unwrap(), "only");
        assert!(s.next().is_none());
        assert!(s.next().is_none());
    }
}
