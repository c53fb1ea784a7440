use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, instrument, warn};

use super::picker::{PhotoAsset, PhotoPicker};
use super::Notice;
use crate::classifier::dto::NutrientRow;
use crate::classifier::{Classifier, ScanResult};
use crate::error::AppError;
use crate::session::SessionContext;

pub const INVALID_RESULT_MESSAGE: &str = "Cannot save invalid result";
pub const SAVED_MESSAGE: &str = "Scan saved to your history!";
pub const SAVE_FAILED_MESSAGE: &str = "Failed to save scan";
pub const NUTRITION_TITLE: &str = "Nutrition Facts (per 100g)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    PhotoSelected,
    Classifying,
    ResultShown,
    Saving,
}

#[derive(Debug)]
struct ScanState {
    phase: ScanPhase,
    photo: Option<PhotoAsset>,
    result: Option<ScanResult>,
    nutrition_expanded: bool,
    /// Bumped by anything that makes outstanding work stale.
    generation: u64,
}

impl ScanState {
    fn can_classify(&self) -> bool {
        self.photo.is_some()
            && matches!(self.phase, ScanPhase::PhotoSelected | ScanPhase::ResultShown)
    }

    fn can_save(&self) -> bool {
        self.phase == ScanPhase::ResultShown
            && matches!(self.result, Some(ScanResult::Classified(_)))
    }

    fn clear(&mut self) {
        self.generation += 1;
        self.phase = ScanPhase::Idle;
        self.photo = None;
        self.result = None;
        self.nutrition_expanded = false;
    }
}

/// Rendered form of a classify result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultCard {
    /// Indicator and label, e.g. "🟢 apple".
    pub headline: String,
    pub score: String,
    pub scoring_system: Option<String>,
    /// Only present when the nutrition section is expanded.
    pub nutrition: Option<Vec<NutrientRow>>,
}

/// What the scan screen should currently display.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanView {
    pub phase: ScanPhase,
    pub photo_uri: Option<String>,
    pub card: Option<ResultCard>,
    pub error: Option<String>,
    pub nutrition_expanded: bool,
    pub can_classify: bool,
    pub can_save: bool,
}

/// Photo → classify → save flow.
///
/// One operation is in flight at a time: a classify or save requested while
/// another is outstanding is refused, as a disabled button would. Picking a
/// new photo or resetting invalidates whatever is outstanding.
pub struct ScanScreen {
    session: Arc<SessionContext>,
    classifier: Arc<dyn Classifier>,
    picker: Arc<dyn PhotoPicker>,
    state: Mutex<ScanState>,
}

impl ScanScreen {
    pub fn new(
        session: Arc<SessionContext>,
        classifier: Arc<dyn Classifier>,
        picker: Arc<dyn PhotoPicker>,
    ) -> Self {
        Self {
            session,
            classifier,
            picker,
            state: Mutex::new(ScanState {
                phase: ScanPhase::Idle,
                photo: None,
                result: None,
                nutrition_expanded: false,
                generation: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns whether a photo was picked.
    pub async fn capture(&self) -> Result<bool, AppError> {
        let asset = self.picker.launch_camera().await?;
        Ok(self.select(asset))
    }

    pub async fn choose(&self) -> Result<bool, AppError> {
        let asset = self.picker.launch_library().await?;
        Ok(self.select(asset))
    }

    fn select(&self, asset: Option<PhotoAsset>) -> bool {
        let Some(asset) = asset else {
            debug!("photo picker cancelled");
            return false;
        };
        let mut st = self.state();
        st.clear();
        debug!(uri = %asset.uri, "photo selected");
        st.photo = Some(asset);
        st.phase = ScanPhase::PhotoSelected;
        true
    }

    /// Sends the current photo to the classifier. Returns whether a result
    /// was applied; a no-op without a photo or while busy.
    #[instrument(skip(self))]
    pub async fn classify(&self) -> bool {
        let (generation, data) = {
            let mut st = self.state();
            if !st.can_classify() {
                debug!(phase = ?st.phase, "classify ignored");
                return false;
            }
            let Some(photo) = st.photo.as_ref() else {
                return false;
            };
            let data = photo.data.clone();
            st.phase = ScanPhase::Classifying;
            (st.generation, data)
        };

        let result = self.classifier.classify(data).await;

        let mut st = self.state();
        if st.generation != generation {
            debug!("stale classification dropped");
            return false;
        }
        match &result {
            ScanResult::Classified(c) => info!(label = %c.label, signal = %c.signal, score = c.score, "classified"),
            ScanResult::Failed { error } => warn!(%error, "classification failed"),
        }
        st.result = Some(result);
        st.nutrition_expanded = false;
        st.phase = ScanPhase::ResultShown;
        true
    }

    /// Records the shown result for the current user, then clears the screen
    /// for the next scan. On failure the result stays up so it can be retried.
    #[instrument(skip(self))]
    pub async fn save(&self) -> Result<Notice, AppError> {
        let (generation, classification) = {
            let mut st = self.state();
            if st.phase == ScanPhase::Saving {
                return Err(AppError::validation("Save already in progress"));
            }
            let classification = match (&st.phase, &st.result) {
                (ScanPhase::ResultShown, Some(ScanResult::Classified(c))) => c.clone(),
                _ => return Err(AppError::validation(INVALID_RESULT_MESSAGE)),
            };
            st.phase = ScanPhase::Saving;
            (st.generation, classification)
        };

        let saved = self
            .session
            .record_scan(
                &classification.label,
                classification.signal,
                classification.score,
                classification.nutrition.clone(),
                Some(classification.scoring.clone()),
            )
            .await;

        let mut st = self.state();
        let current = st.generation == generation;
        match saved {
            Ok(_) => {
                if current {
                    st.clear();
                }
                Ok(Notice::success(SAVED_MESSAGE))
            }
            Err(e) => {
                warn!(error = %e, "save scan failed");
                if current {
                    st.phase = ScanPhase::ResultShown;
                }
                Err(AppError::Persistence(SAVE_FAILED_MESSAGE.into()))
            }
        }
    }

    /// Discards the photo and result.
    pub fn reset(&self) {
        self.state().clear();
    }

    pub fn toggle_nutrition(&self) {
        let mut st = self.state();
        if matches!(st.result, Some(ScanResult::Classified(_))) {
            st.nutrition_expanded = !st.nutrition_expanded;
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.state().phase
    }

    pub fn view(&self) -> ScanView {
        let st = self.state();
        let (card, error) = match &st.result {
            Some(ScanResult::Classified(c)) => (
                Some(ResultCard {
                    headline: format!("{} {}", c.signal.indicator(), c.label),
                    score: c.score_text(),
                    scoring_system: c.scoring.scoring_system.clone(),
                    nutrition: st.nutrition_expanded.then(|| c.nutrition.rows()),
                }),
                None,
            ),
            Some(ScanResult::Failed { error }) => (None, Some(error.clone())),
            None => (None, None),
        };
        ScanView {
            phase: st.phase,
            photo_uri: st.photo.as_ref().map(|p| p.uri.clone()),
            card,
            error,
            nutrition_expanded: st.nutrition_expanded,
            can_classify: st.can_classify(),
            can_save: st.can_save(),
        }
    }
}
