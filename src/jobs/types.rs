use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-side status of a long-running job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Running,
  Succeeded,
  Failed,
}

impl JobStatus {
  /// Statuses under which polling continues
  pub fn is_active(&self) -> bool {
    matches!(self, JobStatus::Pending | JobStatus::Running)
  }

  pub fn is_terminal(&self) -> bool {
    !self.is_active()
  }
}

/// A job as reported by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  pub status: JobStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub result: Option<Value>,
  /// Failure reason reported by the job itself (not a fetch failure)
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl Job {
  pub fn new(id: impl Into<String>, status: JobStatus) -> Self {
    Self {
      id: id.into(),
      status,
      result: None,
      error: None,
    }
  }

  pub fn with_result(mut self, result: impl Into<Value>) -> Self {
    self.result = Some(result.into());
    self
  }

  pub fn with_error(mut self, error: impl Into<String>) -> Self {
    self.error = Some(error.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_wire_format() {
    let job: Job = serde_json::from_str(r#"{"id":"J1","status":"running"}"#).unwrap();
    assert_eq!(job, Job::new("J1", JobStatus::Running));

    let done = Job::new("J1", JobStatus::Succeeded).with_result(42);
    assert_eq!(
      serde_json::to_string(&done).unwrap(),
      r#"{"id":"J1","status":"succeeded","result":42}"#
    );
  }

  #[test]
  fn test_active_and_terminal() {
    assert!(JobStatus::Pending.is_active());
    assert!(JobStatus::Running.is_active());
    assert!(JobStatus::Succeeded.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
  }
}
