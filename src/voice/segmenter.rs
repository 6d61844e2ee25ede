//! # Incremental Sentence Segmentation
//!
//! Splits a growing reply into speakable sentence units while the completion
//! capability is still producing it.
//!
//! ## Boundary Rules:
//! - A boundary is a run of `.`, `!` or `?`, optionally followed by closing
//!   quotes or brackets, then whitespace, then an uppercase letter
//! - The end of the reply is always a boundary
//! - A boundary is only confirmed once the character after the whitespace has
//!   arrived; until then it is provisional and nothing is emitted
//! - A `.` ending a well-known abbreviation (`Mr.`, `e.g.`) never splits
//!
//! ## Emission Rules:
//! - Units are emitted once, in order, and never revised
//! - Concatenating the emitted units always yields a prefix of the reply
//! - A segment shorter than `min_chars` is merged into the unit before it.
//!   To make that possible without revising emitted text, a finished segment
//!   is held back until at least `min_chars` of the next segment exist
//!
//! Scanning resumes where it stopped, so each pushed fragment costs time
//! proportional to the new text rather than the whole reply.

/// Tokens whose trailing `.` does not end a sentence. Compared lowercase.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "approx",
];

const CLOSERS: &[char] = &['"', '\'', ')', ']', '}', '\u{201D}', '\u{2019}', '\u{00BB}'];

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\u{2026}')
}

fn is_closer(c: char) -> bool {
    CLOSERS.contains(&c)
}

/// Length used for the minimum-size rule: characters, ignoring surrounding whitespace.
fn speakable_len(text: &str) -> usize {
    text.trim().chars().count()
}

/// Whether the terminator at byte `at` closes an abbreviation such as "Dr.".
fn ends_abbreviation(text: &str, at: usize) -> bool {
    if !text[at..].starts_with('.') {
        return false;
    }
    let word_start = text[..at]
        .rfind(|c: char| c.is_whitespace() || c == '(' || c == '"')
        .map(|i| i + 1)
        .unwrap_or(0);
    let word = text[word_start..at].to_lowercase();
    !word.is_empty() && ABBREVIATIONS.contains(&word.as_str())
}

enum Scan {
    /// Confirmed boundary; the next sentence starts at this byte offset.
    Boundary(usize),
    /// Reached the end of the text on a terminator that cannot be judged yet.
    Pending(usize),
    /// No terminator left in the text.
    Exhausted,
}

/// Look for the first boundary in `text[from..]`.
fn scan(text: &str, from: usize) -> Scan {
    let mut offsets = text[from..].char_indices().map(|(i, c)| (from + i, c));

    while let Some((at, c)) = offsets.next() {
        if !is_terminator(c) {
            continue;
        }

        let mut rest = text[at..].char_indices().map(|(i, c)| (at + i, c)).peekable();
        while rest.next_if(|&(_, c)| is_terminator(c)).is_some() {}
        while rest.next_if(|&(_, c)| is_closer(c)).is_some() {}
        let mut saw_whitespace = false;
        while rest.next_if(|&(_, c)| c.is_whitespace()).is_some() {
            saw_whitespace = true;
        }

        match rest.peek() {
            None => return Scan::Pending(at),
            Some(&(next, c)) if saw_whitespace && c.is_uppercase() => {
                if !ends_abbreviation(text, at) {
                    return Scan::Boundary(next);
                }
            }
            Some(_) => {}
        }
    }

    Scan::Exhausted
}

/// Stateful splitter for one reply.
#[derive(Debug)]
pub struct SentenceSegmenter {
    text: String,
    /// Start of the text not yet assigned to a finished segment.
    cursor: usize,
    /// Where the next scan resumes; never behind `cursor`.
    scan_from: usize,
    /// Finished segment waiting to learn whether the next one is long enough.
    held: Option<String>,
    emitted: usize,
    min_chars: usize,
}

impl SentenceSegmenter {
    pub fn new(min_chars: usize) -> Self {
        Self {
            text: String::new(),
            cursor: 0,
            scan_from: 0,
            held: None,
            emitted: 0,
            min_chars,
        }
    }

    /// Feed the next fragment; returns the units that became ready, in order.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.text.push_str(fragment);
        let mut ready = Vec::new();

        loop {
            match scan(&self.text, self.scan_from) {
                Scan::Boundary(end) => {
                    let segment = self.text[self.cursor..end].to_string();
                    self.cursor = end;
                    self.scan_from = end;
                    self.accept(segment, &mut ready);
                }
                Scan::Pending(at) => {
                    self.scan_from = at;
                    break;
                }
                Scan::Exhausted => {
                    self.scan_from = self.text.len();
                    break;
                }
            }
        }

        // Once the unfinished tail is long enough, whatever segment it becomes
        // cannot be merged backwards, so the held one is safe to release.
        if self.held.is_some() && speakable_len(&self.text[self.cursor..]) >= self.min_chars {
            if let Some(held) = self.held.take() {
                self.emit(held, &mut ready);
            }
        }

        ready
    }

    /// The reply is complete: flush the held segment and the trailing text.
    pub fn finish(&mut self) -> Vec<String> {
        let mut ready = Vec::new();
        let tail = self.text[self.cursor..].to_string();
        self.cursor = self.text.len();
        self.scan_from = self.cursor;

        if speakable_len(&tail) == 0 {
            // Trailing whitespace rides along with the held unit, if any.
            if let Some(mut held) = self.held.take() {
                held.push_str(&tail);
                self.emit(held, &mut ready);
            }
            return ready;
        }

        self.accept(tail, &mut ready);
        if let Some(held) = self.held.take() {
            self.emit(held, &mut ready);
        }
        ready
    }

    /// Flush only what is already a complete sentence; used when the reply is
    /// cut short. The unfinished tail is dropped.
    pub fn finish_complete(&mut self) -> Vec<String> {
        let mut ready = Vec::new();
        if let Some(held) = self.held.take() {
            self.emit(held, &mut ready);
        }
        ready
    }

    /// Everything pushed so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn accept(&mut self, segment: String, ready: &mut Vec<String>) {
        match self.held.take() {
            Some(mut held) if speakable_len(&segment) < self.min_chars => {
                held.push_str(&segment);
                self.held = Some(held);
            }
            Some(held) => {
                self.emit(held, ready);
                self.held = Some(segment);
            }
            None => self.held = Some(segment),
        }
    }

    fn emit(&mut self, unit: String, ready: &mut Vec<String>) {
        self.emitted += 1;
        ready.push(unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_all(text: &str, min_chars: usize) -> Vec<String> {
        let mut segmenter = SentenceSegmenter::new(min_chars);
        let mut units = segmenter.push(text);
        units.extend(segmenter.finish());
        units
    }

    fn stream(fragments: &[&str], min_chars: usize) -> (Vec<String>, Vec<Vec<String>>) {
        let mut segmenter = SentenceSegmenter::new(min_chars);
        let mut steps = Vec::new();
        let mut all = Vec::new();
        for fragment in fragments {
            let ready = segmenter.push(fragment);
            all.extend(ready.clone());
            steps.push(ready);
        }
        let rest = segmenter.finish();
        all.extend(rest.clone());
        steps.push(rest);
        (all, steps)
    }

    #[test]
    fn test_splits_on_terminal_punctuation() {
        let units = segment_all(
            "Hello there, friend. How are you today? I am doing great!",
            10,
        );
        assert_eq!(
            units,
            vec![
                "Hello there, friend. ",
                "How are you today? ",
                "I am doing great!",
            ]
        );
    }

    #[test]
    fn test_requires_uppercase_after_whitespace() {
        let units = segment_all("It costs 3.50 dollars. that is cheap. Really it is.", 5);
        assert_eq!(
            units,
            vec!["It costs 3.50 dollars. that is cheap. ", "Really it is."]
        );
    }

    #[test]
    fn test_closing_quote_stays_with_sentence() {
        let units = segment_all("She said \"Good morning.\" Then she left the room.", 10);
        assert_eq!(
            units,
            vec!["She said \"Good morning.\" ", "Then she left the room."]
        );
    }

    #[test]
    fn test_abbreviations_do_not_split() {
        let units = segment_all("Please ask Dr. Smith about it. She knows the answer.", 10);
        assert_eq!(
            units,
            vec!["Please ask Dr. Smith about it. ", "She knows the answer."]
        );
    }

    #[test]
    fn test_short_segment_merges_into_previous() {
        let units = segment_all("That is a very good question. Yes! Let me explain it now.", 10);
        assert_eq!(
            units,
            vec!["That is a very good question. Yes! ", "Let me explain it now."]
        );
    }

    #[test]
    fn test_short_trailing_segment_merges() {
        let units = segment_all("Let me think about that one. Okay.", 10);
        assert_eq!(units, vec!["Let me think about that one. Okay."]);
    }

    #[test]
    fn test_short_first_segment_stands_alone_without_predecessor() {
        let units = segment_all("Hi! Nice to meet you, my friend.", 10);
        assert_eq!(units, vec!["Hi! ", "Nice to meet you, my friend."]);

        let single = segment_all("Hi!", 10);
        assert_eq!(single, vec!["Hi!"]);
    }

    #[test]
    fn test_boundary_waits_for_next_character() {
        let mut segmenter = SentenceSegmenter::new(10);
        assert!(segmenter.push("This is the first sentence.").is_empty());
        assert!(segmenter.push(" ").is_empty());
        // Still unknown whether "e.g." style text or a new sentence follows.
        assert!(segmenter.push("Then").is_empty());
        // Tail is now long enough that the held sentence can be released.
        assert_eq!(
            segmenter.push(" more words arrive"),
            vec!["This is the first sentence. "]
        );
        assert_eq!(segmenter.finish(), vec!["Then more words arrive"]);
    }

    #[test]
    fn test_token_split_terminator_across_fragments() {
        let (units, _) = stream(
            &["Good morning", ", class", ". Today we", " learn verbs", "."],
            10,
        );
        assert_eq!(units, vec!["Good morning, class. ", "Today we learn verbs."]);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let text = "Welcome back! Did you practise yesterday? Great. \
                    Let's review the past tense. Ready? \"Yes,\" you say. Good.";
        let expected = segment_all(text, 10);

        // Feed it in awkward three-byte-ish pieces on char boundaries.
        let chars: Vec<char> = text.chars().collect();
        let pieces: Vec<String> = chars.chunks(3).map(|c| c.iter().collect()).collect();
        let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
        let (units, _) = stream(&refs, 10);

        assert_eq!(units, expected);
    }

    #[test]
    fn test_monotonic_prefix_property() {
        let text = "First we warm up. Then we practise. Ok. After that comes the quiz! Done?";
        let chars: Vec<char> = text.chars().collect();
        let pieces: Vec<String> = chars.chunks(4).map(|c| c.iter().collect()).collect();

        let mut segmenter = SentenceSegmenter::new(10);
        let mut delivered = String::new();
        for piece in &pieces {
            for unit in segmenter.push(piece) {
                delivered.push_str(&unit);
                assert!(text.starts_with(&delivered), "not a prefix: {:?}", delivered);
            }
        }
        for unit in segmenter.finish() {
            delivered.push_str(&unit);
        }
        assert_eq!(delivered, text);
    }

    #[test]
    fn test_no_short_unit_after_first() {
        let text = "Right. So. We begin here today. Yes. No. Maybe later on then. Ok.";
        let units = segment_all(text, 10);
        for unit in units.iter().skip(1) {
            assert!(speakable_len(unit) >= 10, "short unit emitted: {:?}", unit);
        }
        assert_eq!(units.concat(), text);
    }

    #[test]
    fn test_finish_complete_drops_unfinished_tail() {
        let mut segmenter = SentenceSegmenter::new(10);
        assert_eq!(
            segmenter.push("This sentence is complete. And this one is cut"),
            vec!["This sentence is complete. "]
        );
        assert!(segmenter.finish_complete().is_empty());
    }

    #[test]
    fn test_finish_complete_flushes_held_sentence() {
        let mut segmenter = SentenceSegmenter::new(10);
        assert!(segmenter.push("This sentence is complete. An").is_empty());
        assert_eq!(segmenter.finish_complete(), vec!["This sentence is complete. "]);
        assert_eq!(segmenter.emitted(), 1);
    }

    #[test]
    fn test_whitespace_only_reply() {
        assert!(segment_all("   ", 10).is_empty());
    }
}
