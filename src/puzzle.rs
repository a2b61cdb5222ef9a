//! Verification puzzles that gate a risky send.
//!
//! Every puzzle is generated fresh; nothing is carried over between attempts
//! or episodes.

use crate::error::PuzzleError;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::fmt;

const OPERAND_MIN: i64 = 1;
const OPERAND_MAX: i64 = 20;

const REVERSE_WORDS: &[&str] = &[
    "calm", "pause", "regret", "breathe", "later", "think", "sorry", "tomorrow",
];

const COUNT_REFERENCE: &str = "RegretGPT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PuzzleKind {
    Math,
    Reverse,
    Count,
}

impl PuzzleKind {
    pub const ALL: [PuzzleKind; 3] = [PuzzleKind::Math, PuzzleKind::Reverse, PuzzleKind::Count];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
}

impl MathOp {
    const ALL: [MathOp; 3] = [MathOp::Add, MathOp::Sub, MathOp::Mul];

    fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            MathOp::Add => a + b,
            MathOp::Sub => a - b,
            MathOp::Mul => a * b,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            MathOp::Add => "+",
            MathOp::Sub => "-",
            MathOp::Mul => "×",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Number(i64),
    Text(String),
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Number(n) => write!(f, "{}", n),
            Answer::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Puzzle {
    pub kind: PuzzleKind,
    pub question: String,
    expected: Answer,
}

impl Puzzle {
    pub fn math(a: i64, b: i64, op: MathOp) -> Self {
        Self {
            kind: PuzzleKind::Math,
            question: format!("What is {} {} {}?", a, op.symbol(), b),
            expected: Answer::Number(op.apply(a, b)),
        }
    }

    pub fn reverse(word: &str) -> Self {
        Self {
            kind: PuzzleKind::Reverse,
            question: format!("Type \"{}\" backwards.", word),
            expected: Answer::Text(word.chars().rev().collect()),
        }
    }

    /// Case-insensitive occurrences of `letter` in `reference`.
    pub fn count(letter: char, reference: &str) -> Self {
        let needle = letter.to_lowercase().collect::<String>();
        let occurrences = reference
            .chars()
            .filter(|c| c.to_lowercase().collect::<String>() == needle)
            .count();
        Self {
            kind: PuzzleKind::Count,
            question: format!(
                "How many times does \"{}\" appear in \"{}\"? (ignore case)",
                letter.to_uppercase(),
                reference
            ),
            expected: Answer::Number(occurrences as i64),
        }
    }

    pub fn expected_answer(&self) -> &Answer {
        &self.expected
    }

    /// Compares a candidate answer. Numeric puzzles fail with
    /// [`PuzzleError::Malformed`] when the candidate is not a whole number,
    /// and accept only the plain decimal form (no sign, no leading zeros).
    pub fn check(&self, candidate: &str) -> Result<bool, PuzzleError> {
        let candidate = candidate.trim();
        match &self.expected {
            Answer::Number(expected) => {
                let candidate = candidate.replace('\u{2212}', "-");
                candidate
                    .parse::<i64>()
                    .map_err(|_| PuzzleError::Malformed(candidate.clone()))?;
                Ok(candidate == expected.to_string())
            }
            Answer::Text(expected) => Ok(candidate.to_lowercase() == expected.to_lowercase()),
        }
    }
}

/// Picks a kind uniformly, then the kind's parameters uniformly.
pub fn generate() -> Puzzle {
    generate_with(&mut rand::thread_rng())
}

pub fn generate_with<R: Rng>(rng: &mut R) -> Puzzle {
    match rng.gen_range(0..PuzzleKind::ALL.len()) {
        0 => {
            let a = rng.gen_range(OPERAND_MIN..=OPERAND_MAX);
            let b = rng.gen_range(OPERAND_MIN..=OPERAND_MAX);
            let op = MathOp::ALL[rng.gen_range(0..MathOp::ALL.len())];
            Puzzle::math(a, b, op)
        }
        1 => {
            let word = REVERSE_WORDS.choose(rng).copied().unwrap_or("calm");
            Puzzle::reverse(word)
        }
        _ => {
            let mut letters: Vec<char> = COUNT_REFERENCE
                .chars()
                .flat_map(char::to_lowercase)
                .collect();
            letters.sort_unstable();
            letters.dedup();
            let letter = letters.choose(rng).copied().unwrap_or('g');
            Puzzle::count(letter, COUNT_REFERENCE)
        }
    }
}

/// Malformed answers are simply wrong.
pub fn validate(puzzle: &Puzzle, candidate: &str) -> bool {
    puzzle.check(candidate).unwrap_or(false)
}
