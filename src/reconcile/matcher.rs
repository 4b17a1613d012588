use crate::reconcile::traits::Candidate;
use crate::storage::entity::return_record;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// 评分权重。整数计分，保证结果确定、不受浮点误差影响。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPolicy {
    pub receiver_exact: u32,
    pub receiver_partial: u32,
    pub phone_suffix: u32,
    pub product_overlap_max: u32,
    pub min_score: u32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            receiver_exact: 50,
            receiver_partial: 25,
            phone_suffix: 30,
            product_overlap_max: 20,
            min_score: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub matched: Option<Candidate>,
    pub score: u32,
    /// 多个候选并列最高分：调用方不得猜测
    pub ambiguous: bool,
}

impl MatchResult {
    fn none(score: u32, ambiguous: bool) -> Self {
        Self {
            matched: None,
            score,
            ambiguous,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Matcher {
    policy: MatchPolicy,
}

impl Matcher {
    /// 从候选中选出至多一个匹配。
    ///
    /// - 最高分 < min_score：未找到（非错误，稍后重试）
    /// - 最高分并列：ambiguous，不选
    pub fn match_record(
        &self,
        record: &return_record::Model,
        candidates: &[Candidate],
    ) -> MatchResult {
        // 同一句柄重复出现只算一次
        let mut seen = BTreeSet::new();
        let unique: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| seen.insert(c.handle.as_str()))
            .collect();

        let scored: Vec<(u32, &Candidate)> = unique
            .into_iter()
            .map(|c| (self.score(record, c), c))
            .collect();

        let Some(best) = scored.iter().map(|(s, _)| *s).max() else {
            return MatchResult::none(0, false);
        };
        if best < self.policy.min_score {
            return MatchResult::none(best, false);
        }

        let mut top = scored.iter().filter(|(s, _)| *s == best);
        let first = top.next().map(|(_, c)| (*c).clone());
        if top.next().is_some() {
            return MatchResult::none(best, true);
        }

        MatchResult {
            matched: first,
            score: best,
            ambiguous: false,
        }
    }

    pub fn score(&self, record: &return_record::Model, candidate: &Candidate) -> u32 {
        let mut score = 0;

        let a = normalize_name(&record.receiver_name);
        let b = normalize_name(&candidate.receiver_name);
        if !a.is_empty() && !b.is_empty() {
            if a == b {
                score += self.policy.receiver_exact;
            } else if a.contains(&b) || b.contains(&a) {
                score += self.policy.receiver_partial;
            }
        }

        if let (Some(x), Some(y)) = (
            phone_suffix(&record.receiver_phone),
            phone_suffix(&candidate.receiver_phone_suffix),
        ) {
            if x == y {
                score += self.policy.phone_suffix;
            }
        }

        let wanted = product_tokens(&record.product_name);
        if !wanted.is_empty() {
            let offered = product_tokens(&candidate.product_name);
            let shared = wanted.intersection(&offered).count() as u32;
            score += self.policy.product_overlap_max * shared / wanted.len() as u32;
        }

        score
    }
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// 手机号末 4 位；不足 4 位数字（如被完全打码）返回 None
fn phone_suffix(phone: &str) -> Option<String> {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    Some(digits[digits.len() - 4..].iter().collect())
}

fn product_tokens(name: &str) -> BTreeSet<String> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let re = TOKEN.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("static token regex"));
    re.find_iter(name)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}
