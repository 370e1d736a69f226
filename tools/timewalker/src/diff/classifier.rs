//! Optional external annotator for discrepancies.

use crate::diff::findings::{Annotation, Discrepancy};
use crate::errors::TimewalkerError;
use std::sync::{Arc, Mutex};

/// Annotates one discrepancy. Implementations may be slow or unavailable;
/// errors degrade the analysis to rule-based severities.
pub trait DiscrepancyClassifier: Send + Sync {
    fn classify(&self, discrepancy: &Discrepancy) -> Result<Annotation, TimewalkerError>;
}

/// Replays a fixed answer and records what it was asked.
#[derive(Clone)]
pub struct ScriptedClassifier {
    answer: Result<Annotation, String>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl ScriptedClassifier {
    pub fn answering(annotation: Annotation) -> Self {
        Self {
            answer: Ok(annotation),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            answer: Err(message.into()),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Labels of the discrepancies passed to `classify`, in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

impl DiscrepancyClassifier for ScriptedClassifier {
    fn classify(&self, discrepancy: &Discrepancy) -> Result<Annotation, TimewalkerError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(discrepancy.label.clone());
        }
        self.answer.clone().map_err(TimewalkerError::Classifier)
    }
}
