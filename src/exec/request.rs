use serde::Deserialize;
use utoipa::ToSchema;

use super::error::ValidationError;
use crate::config::ExecutionLimits;
use crate::lang::{Registry, Toolchain};

/// Body of `POST /run`
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SubmissionRequest {
    /// Language identifier or alias
    #[schema(example = "python3")]
    pub language: String,

    /// Source code of the submission
    #[serde(alias = "sourceCode")]
    #[schema(example = "n = int(input())\nprint(*range(1, n + 1))\n")]
    pub code: String,

    /// Standard input fed to the run stage
    #[serde(default)]
    #[schema(example = "5\n")]
    pub stdin: String,
}

/// A request that passed validation, bound to its toolchain
#[derive(Debug, Clone)]
pub struct Submission {
    pub toolchain: Toolchain,
    pub code: String,
    pub stdin: String,
}

impl SubmissionRequest {
    pub fn validate(self, registry: &Registry, limits: &ExecutionLimits) -> Result<Submission, ValidationError> {
        let toolchain = registry.lookup(&self.language)?.clone();

        if self.code.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }
        if self.code.len() > limits.max_source_bytes {
            return Err(ValidationError::SourceTooLarge { size: self.code.len(), limit: limits.max_source_bytes });
        }
        if self.stdin.len() > limits.max_stdin_bytes {
            return Err(ValidationError::StdinTooLarge { size: self.stdin.len(), limit: limits.max_stdin_bytes });
        }

        Ok(Submission { toolchain, code: self.code, stdin: self.stdin })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::Language;

    fn request(language: &str, code: &str, stdin: &str) -> SubmissionRequest {
        SubmissionRequest { language: language.to_string(), code: code.to_string(), stdin: stdin.to_string() }
    }

    #[test]
    fn test_valid_request_binds_toolchain() {
        let submission = request("py", "print(1)", "")
            .validate(&Registry::builtin(), &ExecutionLimits::default())
            .unwrap();
        assert_eq!(submission.toolchain.language, Language::Python3);
        assert_eq!(submission.code, "print(1)");
    }

    #[test]
    fn test_rejections() {
        let registry = Registry::builtin();
        let limits = ExecutionLimits { max_source_bytes: 10, max_stdin_bytes: 4, ..Default::default() };

        assert!(matches!(
            request("rust", "fn main(){}", "").validate(&registry, &limits),
            Err(ValidationError::UnsupportedLanguage(_))
        ));
        assert_eq!(
            request("python3", " \n\t", "").validate(&registry, &limits).unwrap_err(),
            ValidationError::EmptySource
        );
        assert_eq!(
            request("python3", "print(12345)", "").validate(&registry, &limits).unwrap_err(),
            ValidationError::SourceTooLarge { size: 12, limit: 10 }
        );
        assert_eq!(
            request("python3", "print(1)", "12345").validate(&registry, &limits).unwrap_err(),
            ValidationError::StdinTooLarge { size: 5, limit: 4 }
        );
    }

    #[test]
    fn test_deserialize_client_body() {
        let req: SubmissionRequest = serde_json::from_str(r#"{"language":"cpp","code":"int main(){}"}"#).unwrap();
        assert_eq!(req.stdin, "");
        let req: SubmissionRequest = serde_json::from_str(r#"{"language":"c","sourceCode":"x","stdin":"1"}"#).unwrap();
        assert_eq!(req.code, "x");
        assert!(serde_json::from_str::<SubmissionRequest>(r#"{"language":"c"}"#).is_err());
    }
}
