use std::sync::Arc;

use tracing::{info, instrument};

use crate::backend::{Profile, ProfileUpdate};
use crate::error::AppError;
use crate::session::SessionContext;

const CM_PER_FOOT: f64 = 30.48;
const CM_PER_INCH: f64 = 2.54;
const KG_PER_POUND: f64 = 0.453592;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeightUnit {
    #[default]
    FeetInches,
    Centimeters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightUnit {
    #[default]
    Pounds,
    Kilograms,
}

/// Leading numeric prefix of `text`, or 0 when there is none.
fn lenient_number(text: &str) -> f64 {
    let text = text.trim();
    let end = text
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || ((c == '-' || c == '+') && i == 0)))
        .map_or(text.len(), |(i, _)| i);
    (1..=end)
        .rev()
        .find_map(|n| text[..n].parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// First-run height and weight form.
pub struct OnboardingScreen {
    session: Arc<SessionContext>,
    pub height_unit: HeightUnit,
    pub weight_unit: WeightUnit,
    pub feet: String,
    pub inches: String,
    pub height_cm: String,
    pub weight_lbs: String,
    pub weight_kg: String,
    pub submitting: bool,
}

impl OnboardingScreen {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self {
            session,
            height_unit: HeightUnit::default(),
            weight_unit: WeightUnit::default(),
            feet: String::new(),
            inches: String::new(),
            height_cm: String::new(),
            weight_lbs: String::new(),
            weight_kg: String::new(),
            submitting: false,
        }
    }

    pub fn toggle_height_unit(&mut self) {
        self.height_unit = match self.height_unit {
            HeightUnit::FeetInches => HeightUnit::Centimeters,
            HeightUnit::Centimeters => HeightUnit::FeetInches,
        };
    }

    pub fn toggle_weight_unit(&mut self) {
        self.weight_unit = match self.weight_unit {
            WeightUnit::Pounds => WeightUnit::Kilograms,
            WeightUnit::Kilograms => WeightUnit::Pounds,
        };
    }

    /// Height in whole centimetres when entered as ft/in.
    pub fn height_in_cm(&self) -> f64 {
        match self.height_unit {
            HeightUnit::Centimeters => lenient_number(&self.height_cm),
            HeightUnit::FeetInches => {
                let cm = lenient_number(&self.feet) * CM_PER_FOOT
                    + lenient_number(&self.inches) * CM_PER_INCH;
                cm.round()
            }
        }
    }

    /// Weight in kilograms, one decimal when entered as pounds.
    pub fn weight_in_kg(&self) -> f64 {
        match self.weight_unit {
            WeightUnit::Kilograms => lenient_number(&self.weight_kg),
            WeightUnit::Pounds => (lenient_number(&self.weight_lbs) * KG_PER_POUND * 10.0).round() / 10.0,
        }
    }

    /// Saves height and weight and marks onboarding done; returns the profile
    /// as re-read after the write.
    #[instrument(skip(self))]
    pub async fn submit(&mut self) -> Result<Option<Profile>, AppError> {
        let height_cm = self.height_in_cm();
        let weight_kg = self.weight_in_kg();
        if height_cm <= 0.0 || weight_kg <= 0.0 {
            return Err(AppError::validation("Please enter valid height and weight"));
        }

        self.submitting = true;
        let res = self
            .session
            .update_user_profile(ProfileUpdate {
                height_cm: Some(height_cm),
                weight_kg: Some(weight_kg),
                onboarding_completed: Some(true),
                ..Default::default()
            })
            .await;
        self.submitting = false;

        let profile = res?;
        info!(height_cm, weight_kg, "onboarding completed");
        Ok(profile)
    }
}

#[cfg(test)]
mod onboarding_tests {
    use super::*;
    use crate::backend::local::local_tests::test_jwt;
    use crate::backend::LocalBackend;
    use crate::session::Route;

    #[test]
    fn lenient_number_reads_leading_digits() {
        assert_eq!(lenient_number("5"), 5.0);
        assert_eq!(lenient_number(" 5.5ft"), 5.5);
        assert_eq!(lenient_number("abc"), 0.0);
        assert_eq!(lenient_number(""), 0.0);
        assert_eq!(lenient_number("-3"), -3.0);
        assert_eq!(lenient_number("1.2.3"), 1.2);
    }

    async fn screen() -> OnboardingScreen {
        let backend = Arc::new(LocalBackend::in_memory(&test_jwt(), false));
        let ctx = SessionContext::start(backend, "nutrisignal://auth/callback");
        ctx.ready().await;
        ctx.sign_up("a@b.co", "hunter22", Some("A"), Some("B")).await.unwrap();
        ctx.wait_until(|s| s.profile.is_some()).await;
        OnboardingScreen::new(ctx)
    }

    #[tokio::test]
    async fn imperial_units_are_converted() {
        let mut form = screen().await;
        form.feet = "5".into();
        form.inches = "10".into();
        form.weight_lbs = "150".into();
        assert_eq!(form.height_in_cm(), 178.0);
        assert_eq!(form.weight_in_kg(), 68.0);

        form.toggle_height_unit();
        form.toggle_weight_unit();
        form.height_cm = "172.5".into();
        form.weight_kg = "61.3".into();
        assert_eq!(form.height_in_cm(), 172.5);
        assert_eq!(form.weight_in_kg(), 61.3);
    }

    #[tokio::test]
    async fn zero_or_missing_values_are_rejected() {
        let mut form = screen().await;
        form.feet = "5".into();
        form.weight_lbs = "heavy".into();
        let err = form.submit().await.unwrap_err();
        assert_eq!(err.to_string(), "Please enter valid height and weight");
    }

    #[tokio::test]
    async fn submit_completes_onboarding() {
        let mut form = screen().await;
        assert_eq!(form.session.snapshot().route(), Route::Onboarding);

        form.feet = "6".into();
        form.inches = "0".into();
        form.weight_lbs = "180".into();
        let profile = form.submit().await.unwrap().expect("profile");

        assert_eq!(profile.height_cm, Some(183.0));
        assert_eq!(profile.weight_kg, Some(81.6));
        assert!(profile.is_onboarded());
        assert_eq!(form.session.snapshot().route(), Route::Main);
    }
}
