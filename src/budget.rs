/// Estimates the model-token cost of a text fragment.
///
/// Implementations must be monotonic in text length and should err on the
/// side of over-estimating: an under-estimate lets the backend truncate.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u32;
}

/// Byte-length heuristic.
///
/// English averages roughly 4 bytes per token and CJK roughly 3 bytes per
/// token (one character), so dividing UTF-8 bytes by 3 over-estimates Latin
/// text by about a third and stays close on CJK. A fixed per-fragment
/// overhead covers role markers and separators the backend template adds.
#[derive(Debug, Clone)]
pub struct ByteHeuristic {
    pub bytes_per_token: u32,
    pub overhead_per_fragment: u32,
}

impl Default for ByteHeuristic {
    fn default() -> Self {
        Self {
            bytes_per_token: 3,
            overhead_per_fragment: 4,
        }
    }
}

impl TokenEstimator for ByteHeuristic {
    fn estimate(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let per = self.bytes_per_token.max(1) as usize;
        let body = text.len().div_ceil(per);
        (body as u32).saturating_add(self.overhead_per_fragment)
    }
}

/// Estimate tokens for a plain string with the default heuristic.
pub fn estimate_str_tokens(s: &str) -> u32 {
    ByteHeuristic::default().estimate(s)
}

/// Cut `text` so its estimate fits in `max_tokens`, keeping the head.
/// Returns the text unchanged when it already fits.
pub fn truncate_to_tokens(estimator: &dyn TokenEstimator, text: &str, max_tokens: u32) -> String {
    if estimator.estimate(text) <= max_tokens {
        return text.to_string();
    }

    // Binary search over char boundaries; the estimator is monotonic.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if estimator.estimate(&text[..boundaries[mid]]) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    text[..boundaries[lo]].to_string()
}
