use serde::{Deserialize, Serialize};

use super::ChunkTranscription;

/// Timestamped transcript assembled from ordered chunk results
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub text: String,
    /// Words of recognized speech, timestamps and failure notes excluded
    pub word_count: usize,
    pub char_count: usize,
    pub segment_count: usize,
}

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.segment_count == 0
    }
}

/// Clock time as `mm:ss`, or `hh:mm:ss` once past the first hour
pub fn format_clock(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{:02}:{:02}", minutes, secs)
    }
}

/// Line prefix for a segment starting at `seconds`
pub fn format_timestamp(seconds: f64) -> String {
    format!("[{}]", format_clock(seconds))
}

/// Join chunk results into one transcript, ordered by chunk index
/// whatever order they arrive in
pub fn assemble(mut results: Vec<ChunkTranscription>) -> Transcript {
    if results.is_empty() {
        return Transcript::default();
    }

    results.sort_by_key(|r| r.index);

    let mut word_count = 0;
    let lines: Vec<String> = results
        .iter()
        .map(|r| {
            let text = clean_text(&r.text);
            if !r.error {
                word_count += text.split_whitespace().count();
            }
            if text.is_empty() {
                format_timestamp(r.start_time)
            } else {
                format!("{} {}", format_timestamp(r.start_time), text)
            }
        })
        .collect();

    let text = lines.join("\n\n");
    Transcript {
        char_count: text.chars().count(),
        word_count,
        segment_count: results.len(),
        text,
    }
}

fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, text: &str, error: bool) -> ChunkTranscription {
        ChunkTranscription {
            index,
            start_time: index as f64 * 30.0,
            end_time: (index + 1) as f64 * 30.0,
            text: text.to_string(),
            error,
            error_message: None,
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "[00:00]");
        assert_eq!(format_timestamp(65.4), "[01:05]");
        assert_eq!(format_timestamp(3599.9), "[59:59]");
        assert_eq!(format_timestamp(3725.0), "[01:02:05]");
        assert_eq!(format_timestamp(-1.0), "[00:00]");
    }

    #[test]
    fn test_assemble_restores_index_order() {
        let results = vec![
            chunk(2, "third", false),
            chunk(0, "first", false),
            chunk(1, "second", false),
        ];
        let transcript = assemble(results);
        assert_eq!(
            transcript.text,
            "[00:00] first\n\n[00:30] second\n\n[01:00] third"
        );
        assert_eq!(transcript.segment_count, 3);
        assert_eq!(transcript.word_count, 3);
        assert_eq!(transcript.char_count, transcript.text.chars().count());
    }

    #[test]
    fn test_failed_chunks_stay_in_place() {
        let results = vec![
            chunk(0, "hello there", false),
            chunk(1, "[Transcription failed for 00:30-01:00: 503]", true),
            chunk(2, "general kenobi", false),
        ];
        let transcript = assemble(results);
        let lines: Vec<&str> = transcript.text.split("\n\n").collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("[00:30] [Transcription failed"));
        assert_eq!(transcript.word_count, 4);
    }

    #[test]
    fn test_whitespace_is_normalized() {
        let transcript = assemble(vec![chunk(0, "  lots\n of   space ", false)]);
        assert_eq!(transcript.text, "[00:00] lots of space");
    }

    #[test]
    fn test_empty_input() {
        let transcript = assemble(Vec::new());
        assert!(transcript.is_empty());
        assert_eq!(transcript.text, "");
        assert_eq!(transcript.word_count, 0);
    }
}
