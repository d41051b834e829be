use super::EvaluationError;
use crate::distributed::fs::publish_replace;
use serde::Serialize;
use serde_json::Value;
use std::{fs, path::Path};
use tracing::{debug, info, instrument};

/// A single record in the prediction format of the scoring harness
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Prediction<'a> {
    pub instance_id: &'a str,
    pub model_patch: &'a str,
    pub model_name_or_path: &'a str,
}

/// Convert aggregated result records into harness predictions.
///
/// `patch_pointer` is a JSON pointer into each record, a record without a patch predicts the
/// empty patch. Records without an `instance_id` fail the whole conversion, as does an input
/// without any record. Returns the number of predictions written.
#[instrument(skip(model_name, patch_pointer), level = "info")]
pub fn to_predictions(
    aggregated: &Path,
    predictions: &Path,
    model_name: &str,
    patch_pointer: &str,
) -> Result<usize, EvaluationError> {
    let contents = fs::read_to_string(aggregated).map_err(|source| EvaluationError::Read {
        path: aggregated.to_path_buf(),
        source,
    })?;

    let mut converted = Vec::new();
    let mut count = 0;
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: Value =
            serde_json::from_str(line).map_err(|source| EvaluationError::MalformedRecord {
                line: number + 1,
                source,
            })?;
        let instance_id = record
            .get("instance_id")
            .and_then(Value::as_str)
            .ok_or(EvaluationError::MissingInstanceId { line: number + 1 })?;
        let model_patch = record
            .pointer(patch_pointer)
            .and_then(Value::as_str)
            .unwrap_or_else(|| {
                debug!(instance = instance_id, "Record has no patch");
                ""
            });

        let prediction = Prediction {
            instance_id,
            model_patch,
            model_name_or_path: model_name,
        };
        serde_json::to_writer(&mut converted, &prediction).map_err(|source| {
            EvaluationError::MalformedRecord {
                line: number + 1,
                source,
            }
        })?;
        converted.push(b'\n');
        count += 1;
    }

    if count == 0 {
        return Err(EvaluationError::NoPredictions(aggregated.to_path_buf()));
    }

    publish_replace(predictions, &converted).map_err(|source| EvaluationError::Write {
        path: predictions.to_path_buf(),
        source,
    })?;
    info!("Converted {count} records into {:?}", predictions);

    Ok(count)
}
