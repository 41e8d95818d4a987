use crate::domain::models::BpStatus;

/// Map a systolic/diastolic pair (mmHg) to a clinical category.
///
/// Branches are checked top to bottom and the first match wins:
///
/// ```text
/// systolic < 120 and diastolic < 80  -> Normal
/// systolic < 130 and diastolic < 80  -> Elevated
/// systolic < 140 or  diastolic < 90  -> High
/// otherwise                          -> HypertensiveCrisis
/// ```
pub fn classify(systolic: u16, diastolic: u16) -> BpStatus {
    if systolic < 120 && diastolic < 80 {
        BpStatus::Normal
    } else if systolic < 130 && diastolic < 80 {
        BpStatus::Elevated
    } else if systolic < 140 || diastolic < 90 {
        BpStatus::High
    } else {
        BpStatus::HypertensiveCrisis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_points() {
        assert_eq!(classify(119, 79), BpStatus::Normal);
        assert_eq!(classify(120, 79), BpStatus::Elevated);
        assert_eq!(classify(129, 79), BpStatus::Elevated);
        assert_eq!(classify(130, 85), BpStatus::High);
        assert_eq!(classify(181, 121), BpStatus::HypertensiveCrisis);
    }

    #[test]
    fn test_diastolic_alone_can_raise_category() {
        assert_eq!(classify(110, 80), BpStatus::High);
        assert_eq!(classify(125, 85), BpStatus::High);
    }

    #[test]
    fn test_or_branch_keeps_high_when_one_side_is_low() {
        // 150/85 is still "High" because diastolic < 90
        assert_eq!(classify(150, 85), BpStatus::High);
        assert_eq!(classify(135, 95), BpStatus::High);
        assert_eq!(classify(140, 90), BpStatus::HypertensiveCrisis);
    }
}
