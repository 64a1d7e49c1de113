use std::collections::HashSet;

use serde_json::Value as JsonValue;

/// Closed set of question kinds. Scoring matches on this exhaustively so a
/// new kind cannot be added without deciding how it grades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionType {
    MultipleChoice,
    ChooseAll,
    OpenQuestion,
    Matching,
}

impl QuestionType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "multiple_choice" => Some(Self::MultipleChoice),
            "choose_all" => Some(Self::ChooseAll),
            "open_question" => Some(Self::OpenQuestion),
            "matching" => Some(Self::Matching),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultipleChoice => "multiple_choice",
            Self::ChooseAll => "choose_all",
            Self::OpenQuestion => "open_question",
            Self::Matching => "matching",
        }
    }
}

/// `points` is None when the question cannot be auto-graded and a teacher
/// has to score it by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreResult {
    pub points: Option<f64>,
    pub needs_manual_review: bool,
}

impl ScoreResult {
    fn auto(points: f64) -> Self {
        Self {
            points: Some(points),
            needs_manual_review: false,
        }
    }

    fn manual() -> Self {
        Self {
            points: None,
            needs_manual_review: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchingPair {
    pub left: String,
    pub right: String,
}

/// The slice of a Question the scorer needs.
#[derive(Debug, Clone)]
pub struct QuestionView {
    pub question_type: QuestionType,
    pub points: f64,
    pub correct_option_ids: Vec<String>,
    pub key_words: Option<String>,
    pub correct_answer_text: Option<String>,
    pub matching_pairs: Vec<MatchingPair>,
}

/// The slice of an Answer the scorer needs.
#[derive(Debug, Clone, Default)]
pub struct AnswerView {
    pub selected_option_ids: Vec<String>,
    pub text_answer: Option<String>,
    pub matching_answers: Vec<MatchingPair>,
}

/// Parse a matching-pairs JSON array. Entries missing a `left` or `right`
/// key are silently skipped.
pub fn parse_matching_pairs(raw: &str) -> Vec<MatchingPair> {
    let Ok(JsonValue::Array(items)) = serde_json::from_str::<JsonValue>(raw) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(left) = item.get("left").and_then(|v| v.as_str()) else {
            continue;
        };
        let Some(right) = item.get("right").and_then(|v| v.as_str()) else {
            continue;
        };
        out.push(MatchingPair {
            left: left.to_string(),
            right: right.to_string(),
        });
    }
    out
}

pub fn score(question: &QuestionView, answer: &AnswerView) -> ScoreResult {
    match question.question_type {
        QuestionType::MultipleChoice => score_single_select(question, answer),
        QuestionType::ChooseAll => score_choose_all(question, answer),
        QuestionType::OpenQuestion => score_open_question(question, answer),
        QuestionType::Matching => score_matching(question, answer),
    }
}

/// Full points only when exactly one option was selected and it is in the
/// correct set. No partial credit.
fn score_single_select(question: &QuestionView, answer: &AnswerView) -> ScoreResult {
    if answer.selected_option_ids.len() != 1 {
        return ScoreResult::auto(0.0);
    }
    let correct: HashSet<&str> = question
        .correct_option_ids
        .iter()
        .map(|s| s.as_str())
        .collect();
    if correct.contains(answer.selected_option_ids[0].as_str()) {
        ScoreResult::auto(question.points)
    } else {
        ScoreResult::auto(0.0)
    }
}

/// Any incorrect selection zeroes the question; otherwise credit is
/// proportional to the share of correct options picked.
fn score_choose_all(question: &QuestionView, answer: &AnswerView) -> ScoreResult {
    let correct: HashSet<&str> = question
        .correct_option_ids
        .iter()
        .map(|s| s.as_str())
        .collect();
    if correct.is_empty() {
        return ScoreResult::auto(0.0);
    }
    let selected: HashSet<&str> = answer
        .selected_option_ids
        .iter()
        .map(|s| s.as_str())
        .collect();
    if selected.iter().any(|id| !correct.contains(id)) {
        return ScoreResult::auto(0.0);
    }
    let correct_selected = selected.iter().filter(|id| correct.contains(*id)).count();
    let credit = correct_selected as f64 / correct.len() as f64 * question.points;
    ScoreResult::auto(credit)
}

fn score_open_question(question: &QuestionView, answer: &AnswerView) -> ScoreResult {
    let text = answer.text_answer.as_deref().unwrap_or("");

    if let Some(key_words) = question.key_words.as_deref() {
        if !key_words.trim().is_empty() && !text.is_empty() {
            let haystack = text.to_lowercase();
            let hit = key_words
                .split(',')
                .map(|kw| kw.trim().to_lowercase())
                .filter(|kw| !kw.is_empty())
                .any(|kw| haystack.contains(&kw));
            return ScoreResult::auto(if hit { question.points } else { 0.0 });
        }
    }

    if let Some(reference) = question.correct_answer_text.as_deref() {
        if reference.trim().is_empty() {
            return ScoreResult::manual();
        }
        if text.trim().is_empty() {
            return ScoreResult::auto(0.0);
        }
        let expected = normalize_text(reference);
        let got = normalize_text(text);
        if expected == got {
            return ScoreResult::auto(question.points);
        }
        // Binary fuzzy band: close enough is full points, anything else
        // is zero.
        if similarity_ratio(&expected, &got) >= 0.85 {
            return ScoreResult::auto(question.points);
        }
        return ScoreResult::auto(0.0);
    }

    ScoreResult::manual()
}

/// Matching pairs: duplicates in the submission count once, each wrong
/// pair costs a flat quarter of one pair's share, floored at zero.
fn score_matching(question: &QuestionView, answer: &AnswerView) -> ScoreResult {
    let correct: HashSet<MatchingPair> = question
        .matching_pairs
        .iter()
        .map(normalize_pair)
        .collect();
    if correct.is_empty() {
        return ScoreResult::auto(0.0);
    }
    let submitted: HashSet<MatchingPair> = answer
        .matching_answers
        .iter()
        .map(normalize_pair)
        .collect();
    if submitted.is_empty() {
        return ScoreResult::auto(0.0);
    }

    let correct_count = submitted.iter().filter(|p| correct.contains(*p)).count();
    let incorrect_count = submitted.len() - correct_count;

    if correct_count == correct.len() && incorrect_count == 0 {
        return ScoreResult::auto(question.points);
    }

    let total = correct.len() as f64;
    let ratio =
        (correct_count as f64 / total - incorrect_count as f64 * 0.25 / total).max(0.0);
    ScoreResult::auto(ratio * question.points)
}

fn normalize_pair(pair: &MatchingPair) -> MatchingPair {
    MatchingPair {
        left: pair.left.trim().to_lowercase(),
        right: pair.right.trim().to_lowercase(),
    }
}

/// Trim, lowercase, and collapse internal whitespace runs to single spaces.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Edit-distance similarity in [0, 1]: 1 - levenshtein / max_len.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<MatchingPair> {
        raw.iter()
            .map(|(l, r)| MatchingPair {
                left: l.to_string(),
                right: r.to_string(),
            })
            .collect()
    }

    fn choice_question(question_type: QuestionType, points: f64, correct: &[&str]) -> QuestionView {
        QuestionView {
            question_type,
            points,
            correct_option_ids: correct.iter().map(|s| s.to_string()).collect(),
            key_words: None,
            correct_answer_text: None,
            matching_pairs: Vec::new(),
        }
    }

    fn selected(ids: &[&str]) -> AnswerView {
        AnswerView {
            selected_option_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn single_select_exact_hit_or_zero() {
        let q = choice_question(QuestionType::MultipleChoice, 5.0, &["a"]);
        assert_eq!(score(&q, &selected(&["a"])).points, Some(5.0));
        assert_eq!(score(&q, &selected(&["b"])).points, Some(0.0));
        // Selecting more than one option is not a valid single-select answer.
        assert_eq!(score(&q, &selected(&["a", "b"])).points, Some(0.0));
        assert_eq!(score(&q, &selected(&[])).points, Some(0.0));
    }

    #[test]
    fn choose_all_partial_credit_and_false_positive_penalty() {
        let q = choice_question(QuestionType::ChooseAll, 12.0, &["a", "b", "c"]);
        let r = score(&q, &selected(&["a", "b"]));
        assert_eq!(r.points, Some(8.0));
        // Any incorrect pick zeroes the question outright.
        assert_eq!(score(&q, &selected(&["a", "b", "d"])).points, Some(0.0));
        assert_eq!(score(&q, &selected(&["a", "b", "c"])).points, Some(12.0));
    }

    #[test]
    fn open_question_keywords_substring_match() {
        let q = QuestionView {
            question_type: QuestionType::OpenQuestion,
            points: 4.0,
            correct_option_ids: Vec::new(),
            key_words: Some("photosynthesis, Chlorophyll".to_string()),
            correct_answer_text: None,
            matching_pairs: Vec::new(),
        };
        let answer = AnswerView {
            text_answer: Some("Plants use CHLOROPHYLL to capture light".to_string()),
            ..Default::default()
        };
        assert_eq!(score(&q, &answer).points, Some(4.0));

        let miss = AnswerView {
            text_answer: Some("plants are green".to_string()),
            ..Default::default()
        };
        assert_eq!(score(&q, &miss).points, Some(0.0));
    }

    #[test]
    fn open_question_reference_normalized_exact() {
        let q = QuestionView {
            question_type: QuestionType::OpenQuestion,
            points: 3.0,
            correct_option_ids: Vec::new(),
            key_words: None,
            correct_answer_text: Some("Paris is the capital of France".to_string()),
            matching_pairs: Vec::new(),
        };
        let answer = AnswerView {
            text_answer: Some("paris is the capital  of france ".to_string()),
            ..Default::default()
        };
        assert_eq!(score(&q, &answer).points, Some(3.0));
    }

    #[test]
    fn open_question_fuzzy_band_is_binary() {
        let q = QuestionView {
            question_type: QuestionType::OpenQuestion,
            points: 3.0,
            correct_option_ids: Vec::new(),
            key_words: None,
            correct_answer_text: Some("paris is the capital of france".to_string()),
            matching_pairs: Vec::new(),
        };
        // One typo in 30 chars: similarity well above 0.85.
        let close = AnswerView {
            text_answer: Some("paris is the capitol of france".to_string()),
            ..Default::default()
        };
        assert_eq!(score(&q, &close).points, Some(3.0));

        let far = AnswerView {
            text_answer: Some("london".to_string()),
            ..Default::default()
        };
        assert_eq!(score(&q, &far).points, Some(0.0));
    }

    #[test]
    fn open_question_without_config_needs_manual_review() {
        let q = QuestionView {
            question_type: QuestionType::OpenQuestion,
            points: 3.0,
            correct_option_ids: Vec::new(),
            key_words: None,
            correct_answer_text: None,
            matching_pairs: Vec::new(),
        };
        let answer = AnswerView {
            text_answer: Some("an essay".to_string()),
            ..Default::default()
        };
        let r = score(&q, &answer);
        assert_eq!(r.points, None);
        assert!(r.needs_manual_review);
    }

    #[test]
    fn matching_full_partial_and_penalty() {
        let q = QuestionView {
            question_type: QuestionType::Matching,
            points: 10.0,
            correct_option_ids: Vec::new(),
            key_words: None,
            correct_answer_text: None,
            matching_pairs: pairs(&[
                ("France", "Paris"),
                ("Germany", "Berlin"),
                ("Spain", "Madrid"),
                ("Italy", "Rome"),
            ]),
        };

        let all = AnswerView {
            matching_answers: pairs(&[
                ("  france ", " PARIS "),
                ("GERMANY", "berlin"),
                ("Spain", "madrid"),
                ("italy", "ROME"),
            ]),
            ..Default::default()
        };
        assert_eq!(score(&q, &all).points, Some(10.0));

        // 3 correct, no wrong pairs: plain proportional credit.
        let three = AnswerView {
            matching_answers: pairs(&[
                ("France", "Paris"),
                ("Germany", "Berlin"),
                ("Spain", "Madrid"),
            ]),
            ..Default::default()
        };
        assert_eq!(score(&q, &three).points, Some(7.5));

        // 3 correct + 1 wrong: quarter-pair penalty.
        let with_wrong = AnswerView {
            matching_answers: pairs(&[
                ("France", "Paris"),
                ("Germany", "Berlin"),
                ("Spain", "Madrid"),
                ("Italy", "Madrid"),
            ]),
            ..Default::default()
        };
        let r = score(&q, &with_wrong).points.unwrap();
        assert!((r - 6.875).abs() < 1e-9);
    }

    #[test]
    fn matching_duplicates_count_once() {
        let q = QuestionView {
            question_type: QuestionType::Matching,
            points: 10.0,
            correct_option_ids: Vec::new(),
            key_words: None,
            correct_answer_text: None,
            matching_pairs: pairs(&[
                ("France", "Paris"),
                ("Germany", "Berlin"),
                ("Spain", "Madrid"),
                ("Italy", "Rome"),
            ]),
        };
        let dup = AnswerView {
            matching_answers: pairs(&[
                ("France", "Paris"),
                ("France", "Paris"),
                ("Germany", "Berlin"),
                ("Spain", "Madrid"),
                ("Italy", "Rome"),
            ]),
            ..Default::default()
        };
        assert_eq!(score(&q, &dup).points, Some(10.0));
    }

    #[test]
    fn matching_all_wrong_floors_at_zero() {
        let q = QuestionView {
            question_type: QuestionType::Matching,
            points: 10.0,
            correct_option_ids: Vec::new(),
            key_words: None,
            correct_answer_text: None,
            matching_pairs: pairs(&[("France", "Paris"), ("Germany", "Berlin")]),
        };
        let wrong = AnswerView {
            matching_answers: pairs(&[("France", "Berlin"), ("Germany", "Paris")]),
            ..Default::default()
        };
        assert_eq!(score(&q, &wrong).points, Some(0.0));
        assert_eq!(score(&q, &AnswerView::default()).points, Some(0.0));
    }

    #[test]
    fn parse_matching_pairs_skips_incomplete_entries() {
        let raw = r#"[{"left":"a","right":"1"},{"left":"b"},{"right":"2"},{"left":"c","right":"3"}]"#;
        let parsed = parse_matching_pairs(raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].left, "a");
        assert_eq!(parsed[1].right, "3");
    }
}
