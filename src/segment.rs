//! Message segmentation.
//!
//! Some networks do not handle concatenated multipart SMS properly. In
//! compatibility mode the gateway splits messages itself and sends each part
//! as an independent SMS carrying an `"i/N "` indicator. Otherwise the
//! transport's own splitter decides.
//!
//! The per-part budget assumes two encodings: 8 bits per character when every
//! character fits in ISO-8859-1, 16 bits per character otherwise.

use crate::transport::{Transport, TransportError};

/// Part budget when every character is single-byte representable.
pub const SINGLE_BYTE_PART_CHARS: usize = 140;

/// Part budget when any character needs the 16-bit encoding.
pub const WIDE_PART_CHARS: usize = 70;

/// Characters reserved for the `"i/N "` indicator.
const PART_INDICATOR_RESERVE: usize = 4;

/// Part counts at which one more indicator digit is reserved.
const TWO_DIGIT_PARTS: usize = 10;
const THREE_DIGIT_PARTS: usize = 100;

/// How message bodies are split into transmittable parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segmentation {
    /// Let the transport split the message; parts carry no indicator.
    Native,
    /// Split locally with numbered parts (compatibility mode).
    Manual,
}

impl Segmentation {
    /// Select the mode from the compatibility flag.
    pub fn from_compat_flag(compatibility_mode: bool) -> Self {
        if compatibility_mode {
            Self::Manual
        } else {
            Self::Native
        }
    }
}

/// One transmittable piece of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    /// 0-based position within the message.
    pub index: u32,
    /// Number of parts the message was split into.
    pub total: u32,
    /// Rendered text, including any part indicator.
    pub text: String,
}

/// Number the rendered part texts in order.
pub fn number_parts(texts: Vec<String>) -> Vec<MessagePart> {
    let total = u32::try_from(texts.len()).unwrap_or(u32::MAX);
    texts
        .into_iter()
        .zip(0u32..)
        .map(|(text, index)| MessagePart { index, total, text })
        .collect()
}

/// Split `body` according to `mode`.
///
/// # Errors
///
/// Returns the transport's error if native splitting fails. Manual splitting
/// never fails.
pub async fn segment(
    body: &str,
    mode: Segmentation,
    transport: &dyn Transport,
) -> Result<Vec<MessagePart>, TransportError> {
    let texts = match mode {
        Segmentation::Native => {
            let parts = transport.native_split(body).await?;
            if parts.is_empty() {
                vec![body.to_owned()]
            } else {
                parts
            }
        }
        Segmentation::Manual => divide_for_compat(body),
    };
    Ok(number_parts(texts))
}

/// Whether every character of `s` has a code point of 255 or below.
pub fn only_single_byte(s: &str) -> bool {
    s.chars().all(|c| u32::from(c) <= 0xFF)
}

/// Character budget for one part of `body`.
pub fn part_budget(body: &str) -> usize {
    if only_single_byte(body) {
        SINGLE_BYTE_PART_CHARS
    } else {
        WIDE_PART_CHARS
    }
}

/// Split `body` into numbered parts for networks without multipart support.
///
/// Bodies that fit the budget come back unchanged as a single part. Longer
/// bodies are cut into `floor(len / width)` parts, where `width` is the budget
/// minus the indicator reserve, shrunk by one more character once the count
/// reaches two digits and again at three. The last part runs to the end of the
/// body, so it may be longer than `width`. Counts of 1000 or more overflow the
/// reserve.
pub fn divide_for_compat(body: &str) -> Vec<String> {
    let chars: Vec<char> = body.chars().collect();
    let len = chars.len();
    let budget = part_budget(body);

    if len <= budget {
        return vec![body.to_owned()];
    }

    let mut width = budget.saturating_sub(PART_INDICATOR_RESERVE);
    let mut count = len.saturating_div(width);
    if count >= TWO_DIGIT_PARTS {
        width = width.saturating_sub(1);
        count = len.saturating_div(width);
    }
    if count >= THREE_DIGIT_PARTS {
        width = width.saturating_sub(1);
        count = len.saturating_div(width);
    }

    (0..count)
        .map(|i| {
            let start = i.saturating_mul(width);
            let number = i.saturating_add(1);
            let end = if number == count {
                len
            } else {
                start.saturating_add(width).min(len)
            };
            let text: String = chars.get(start..end).unwrap_or_default().iter().collect();
            format!("{number}/{count} {text}")
        })
        .collect()
}
