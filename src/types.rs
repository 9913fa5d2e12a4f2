use serde::{Deserialize, Serialize};

/// 判定しきい値（これを超えると REAL）
pub const DECISION_THRESHOLD: f32 = 0.5;

/// 判定ラベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Label {
    Real,
    Fake,
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Real => write!(f, "REAL"),
            Label::Fake => write!(f, "FAKE"),
        }
    }
}

/// 1枚の画像に対する分類結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// モデル出力（ラベル1 = real である確率）
    pub raw_score: f32,
    pub label: Label,
    /// 判定ラベルに対する確信度 [50, 100]
    pub confidence_percent: f32,
}

impl ClassificationResult {
    /// スコアからしきい値判定で結果を作成
    ///
    /// - score > 0.5  : REAL、確信度 = score × 100
    /// - score <= 0.5 : FAKE、確信度 = (1 - score) × 100
    ///
    /// スコアは [0, 1] に丸めてから判定します。
    pub fn from_score(score: f32) -> Self {
        let raw_score = score.clamp(0.0, 1.0);

        let (label, confidence_percent) = if raw_score > DECISION_THRESHOLD {
            (Label::Real, raw_score * 100.0)
        } else {
            (Label::Fake, (1.0 - raw_score) * 100.0)
        };

        Self {
            raw_score,
            label,
            confidence_percent,
        }
    }

    /// 表示用の確信度文字列（例: "90.00%"）
    pub fn confidence_display(&self) -> String {
        format!("{:.2}%", self.confidence_percent)
    }
}

impl std::fmt::Display for ClassificationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label, self.confidence_display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_high_score_is_real() {
        let result = ClassificationResult::from_score(0.9);
        assert_eq!(result.label, Label::Real);
        assert_eq!(result.confidence_display(), "90.00%");
    }

    #[test]
    fn test_low_score_is_fake() {
        let result = ClassificationResult::from_score(0.1);
        assert_eq!(result.label, Label::Fake);
        assert_eq!(result.confidence_display(), "90.00%");
    }

    #[test]
    fn test_boundary_score_is_fake() {
        let result = ClassificationResult::from_score(0.5);
        assert_eq!(result.label, Label::Fake);
        assert_eq!(result.confidence_percent, 50.0);
        assert_eq!(result.confidence_display(), "50.00%");
    }

    #[test]
    fn test_extremes() {
        let real = ClassificationResult::from_score(1.0);
        assert_eq!(real.label, Label::Real);
        assert_eq!(real.confidence_display(), "100.00%");

        let fake = ClassificationResult::from_score(0.0);
        assert_eq!(fake.label, Label::Fake);
        assert_eq!(fake.confidence_display(), "100.00%");
    }

    #[test]
    fn test_label_serialization() {
        assert_eq!(serde_json::to_string(&Label::Real).unwrap(), "\"REAL\"");
        assert_eq!(format!("{}", Label::Fake), "FAKE");
    }

    proptest! {
        #[test]
        fn prop_above_threshold_is_real(s in 0.500_001f32..=1.0f32) {
            let result = ClassificationResult::from_score(s);
            prop_assert_eq!(result.label, Label::Real);
            prop_assert!((result.confidence_percent - s * 100.0).abs() < 1e-4);
        }

        #[test]
        fn prop_at_or_below_threshold_is_fake(s in 0.0f32..=0.5f32) {
            let result = ClassificationResult::from_score(s);
            prop_assert_eq!(result.label, Label::Fake);
            prop_assert!((result.confidence_percent - (1.0 - s) * 100.0).abs() < 1e-4);
        }

        #[test]
        fn prop_confidence_in_range(s in 0.0f32..=1.0f32) {
            let result = ClassificationResult::from_score(s);
            prop_assert!(result.confidence_percent >= 50.0);
            prop_assert!(result.confidence_percent <= 100.0);
        }
    }
}
