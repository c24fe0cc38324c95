//! Turns one generator response into question records.
//!
//! The response is split into blank-line separated blocks. A block is kept
//! when it has at least six non-empty lines (question, four options, answer)
//! and the token after the last `:` of its final line is one of A–D.
//! Anything else is dropped without affecting the other blocks.

use log::debug;

use crate::quiz::{Letter, Question};

const MIN_BLOCK_LINES: usize = 6;

pub fn parse(raw: &str) -> Vec<(Question, Letter)> {
    let normalized = raw.replace("\r\n", "\n");
    normalized
        .split("\n\n")
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .filter_map(|block| {
            let parsed = parse_block(block);
            if parsed.is_none() {
                debug!("Dropping malformed question block: {:?}", block);
            }
            parsed
        })
        .collect()
}

fn parse_block(block: &str) -> Option<(Question, Letter)> {
    let lines: Vec<&str> = block
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.len() < MIN_BLOCK_LINES {
        return None;
    }

    let (answer_line, prompt_lines) = lines.split_last()?;
    let correct = answer_token(answer_line)?;
    Some((Question::new(prompt_lines.join("\n")), correct))
}

fn answer_token(line: &str) -> Option<Letter> {
    let token = line.rsplit(':').next()?.trim();
    // Only a bare letter counts; "A) option" style tails are rejected.
    if token.chars().count() != 1 {
        return None;
    }
    token.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(question: &str, answer_line: &str) -> String {
        format!("Вопрос: {question}\nA) один\nB) два\nC) три\nD) четыре\n{answer_line}")
    }

    #[test]
    fn parses_blocks_in_order() {
        let raw = [
            block("первый?", "Правильный ответ: A"),
            block("второй?", "Правильный ответ: c"),
        ]
        .join("\n\n");

        let parsed = parse(&raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].1, Letter::A);
        assert_eq!(parsed[1].1, Letter::C);
        assert!(parsed[0].0.text().starts_with("Вопрос: первый?"));
        assert!(parsed[0].0.text().ends_with("D) четыре"));
    }

    #[test]
    fn prompt_never_contains_answer_line() {
        let parsed = parse(&block("x?", "Правильный ответ: B"));
        assert_eq!(parsed.len(), 1);
        assert!(!parsed[0].0.text().contains("Правильный ответ"));
        assert_eq!(parsed[0].0.text().lines().count(), 5);
    }

    #[test]
    fn drops_short_blocks_without_touching_siblings() {
        let raw = format!(
            "{}\n\nВопрос: короткий?\nA) 1\nB) 2\nПравильный ответ: A\n\n{}",
            block("до?", "Правильный ответ: D"),
            block("после?", "Правильный ответ: B"),
        );
        let letters: Vec<Letter> = parse(&raw).into_iter().map(|(_, l)| l).collect();
        assert_eq!(letters, vec![Letter::D, Letter::B]);
    }

    #[test]
    fn drops_blocks_with_bad_answer_letter() {
        let raw = [
            block("плохой?", "Правильный ответ: E"),
            block("без ответа?", "Правильный ответ: A) один"),
            block("хороший?", "Правильный ответ: a"),
        ]
        .join("\n\n");
        let parsed = parse(&raw);
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].0.text().contains("хороший?"));
        assert_eq!(parsed[0].1, Letter::A);
    }

    #[test]
    fn ignores_blank_lines_inside_blocks_and_crlf() {
        let raw = "Вопрос: q?\r\nA) 1\r\n   \r\nB) 2\r\nC) 3\r\nD) 4\r\nОтвет: b";
        // The whitespace-only line splits nothing: "\n   \n" is not "\n\n".
        let parsed = parse(raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].1, Letter::B);
    }

    #[test]
    fn empty_and_garbage_input_yield_nothing() {
        assert!(parse("").is_empty());
        assert!(parse("Извините, я не могу помочь.").is_empty());
    }

    #[test]
    fn parsing_is_deterministic() {
        let raw = [block("1?", "Ответ: A"), block("2?", "Ответ: B")].join("\n\n");
        assert_eq!(parse(&raw), parse(&raw));
    }
}
