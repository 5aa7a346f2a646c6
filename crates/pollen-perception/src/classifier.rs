//! Classification Gateway
//!
//! The flower classifier is an external script.  Each frame spawns one short
//! lived child process:
//!
//! ```text
//! <interpreter> -u <script> --json --model <model>
//!   stdin  : base64 of the image bytes, then EOF
//!   stdout : {"isFlower": bool, "confidence": f64, "class": str, "score": f64}
//!            or {"error": str, ...}
//! ```
//!
//! The interpreter is resolved once at construction: `PYTHON_COMMAND` if set,
//! else `venv/bin/python3` next to the script, else `python3` from `PATH`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use pollen_types::{ClassificationResult, PollenError};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Environment variable overriding interpreter discovery.
pub const INTERPRETER_ENV: &str = "PYTHON_COMMAND";

pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(30);

const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Anything that can tell whether an image shows a flower.
#[async_trait]
pub trait ClassificationGateway: Send + Sync {
    /// Cheap readiness check.  Never errors; an unusable classifier is
    /// simply unavailable.
    async fn is_available(&self) -> bool;

    /// Classify one encoded image.
    ///
    /// # Errors
    ///
    /// - [`PollenError::ClassifierUnavailable`] – the classifier cannot be
    ///   started.
    /// - [`PollenError::Classifier`] – it ran and reported a failure.
    /// - [`PollenError::Protocol`] – its output could not be understood.
    async fn classify(&self, image: &[u8]) -> Result<ClassificationResult, PollenError>;
}

/// Settings for [`ProcessClassifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessClassifierConfig {
    pub interpreter: String,
    pub script: PathBuf,
    pub model: PathBuf,
    pub liveness_timeout: Duration,
    pub classify_timeout: Duration,
}

impl ProcessClassifierConfig {
    /// Config for `script` and `model` with the interpreter resolved by
    /// [`resolve_interpreter`].
    pub fn new(script: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        let script = script.into();
        Self {
            interpreter: resolve_interpreter(&script),
            script,
            model: model.into(),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            classify_timeout: DEFAULT_CLASSIFY_TIMEOUT,
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_classify_timeout(mut self, timeout: Duration) -> Self {
        self.classify_timeout = timeout;
        self
    }
}

/// Pick the interpreter for `script`.
pub fn resolve_interpreter(script: &Path) -> String {
    if let Ok(command) = std::env::var(INTERPRETER_ENV)
        && !command.trim().is_empty()
    {
        return command;
    }
    let venv = script
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("venv")
        .join("bin")
        .join("python3");
    if venv.exists() {
        return venv.to_string_lossy().into_owned();
    }
    "python3".to_string()
}

/// [`ClassificationGateway`] that runs the classifier script per frame.
#[derive(Debug, Clone)]
pub struct ProcessClassifier {
    config: ProcessClassifierConfig,
}

impl ProcessClassifier {
    pub fn new(config: ProcessClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessClassifierConfig {
        &self.config
    }

    fn check_artifacts(&self) -> Result<(), PollenError> {
        if !self.config.script.exists() {
            return Err(PollenError::ClassifierUnavailable(format!(
                "classifier script not found: {}",
                self.config.script.display()
            )));
        }
        if !self.config.model.exists() {
            return Err(PollenError::ClassifierUnavailable(format!(
                "classifier model not found: {}",
                self.config.model.display()
            )));
        }
        Ok(())
    }

    /// `<interpreter> --version` must exit successfully within the liveness
    /// timeout.
    async fn check_interpreter(&self) -> bool {
        let interpreter = &self.config.interpreter;
        let mut child = match Command::new(interpreter)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                debug!(interpreter = %interpreter, error = %e, "interpreter did not start");
                return false;
            }
        };
        match tokio::time::timeout(self.config.liveness_timeout, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(interpreter = %interpreter, error = %e, "interpreter check failed");
                false
            }
            Err(_) => {
                warn!(interpreter = %interpreter, "interpreter check timed out");
                let _ = child.kill().await;
                false
            }
        }
    }
}

#[async_trait]
impl ClassificationGateway for ProcessClassifier {
    async fn is_available(&self) -> bool {
        if let Err(e) = self.check_artifacts() {
            debug!(error = %e, "classifier unavailable");
            return false;
        }
        self.check_interpreter().await
    }

    async fn classify(&self, image: &[u8]) -> Result<ClassificationResult, PollenError> {
        self.check_artifacts()?;
        let config = &self.config;

        // The child runs from the script's directory, so both paths must be
        // absolute.
        let script = absolute(&config.script);
        let model = absolute(&config.model);
        let mut command = Command::new(&config.interpreter);
        command
            .arg("-u")
            .arg(&script)
            .arg("--json")
            .arg("--model")
            .arg(&model)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|e| {
            PollenError::ClassifierUnavailable(format!(
                "failed to spawn classifier ({}): {e}",
                config.interpreter
            ))
        })?;

        let payload = BASE64_STANDARD.encode(image);
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // The child may exit before draining stdin; its verdict still
                // decides the outcome.
                if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "classifier closed stdin early");
                }
            })
        });

        let output = tokio::time::timeout(config.classify_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                PollenError::Classifier(format!(
                    "no verdict within {} ms",
                    config.classify_timeout.as_millis()
                ))
            })?
            .map_err(|e| PollenError::Classifier(format!("failed to collect classifier output: {e}")))?;
        if let Some(feeder) = feeder {
            feeder.abort();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let verdict = interpret_output(output.status.success(), output.status.code(), &stdout, &stderr);
        match &verdict {
            Ok(result) => debug!(
                is_flower = result.is_flower,
                confidence = result.confidence,
                class = %result.class_name,
                "classifier verdict"
            ),
            Err(e) => warn!(error = %e, "classification failed"),
        }
        verdict
    }
}

/// Turn the classifier's exit status and streams into a verdict.
fn interpret_output(
    success: bool,
    code: Option<i32>,
    stdout: &str,
    stderr: &str,
) -> Result<ClassificationResult, PollenError> {
    let stdout = stdout.trim();
    if !success {
        if let Some(message) = parse_json(stdout).as_ref().and_then(error_field) {
            return Err(PollenError::Classifier(message));
        }
        let detail = [stderr.trim(), stdout]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("no output");
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        return Err(PollenError::Classifier(format!(
            "classifier exited with {code}: {}",
            preview(detail)
        )));
    }

    if stdout.is_empty() {
        return Err(PollenError::Protocol("classifier produced no output".into()));
    }
    let value = parse_json(stdout).ok_or_else(|| {
        PollenError::Protocol(format!("unparseable classifier output: {}", preview(stdout)))
    })?;
    if let Some(message) = error_field(&value) {
        return Err(PollenError::Classifier(message));
    }
    serde_json::from_value(value)
        .map_err(|e| PollenError::Protocol(format!("malformed classifier verdict: {e}")))
}

/// Parse the whole output, falling back to its last non-empty line so that
/// stray log output ahead of the verdict is tolerated.
fn parse_json(stdout: &str) -> Option<Value> {
    serde_json::from_str(stdout).ok().or_else(|| {
        stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line.trim()).ok())
    })
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn error_field(value: &Value) -> Option<String> {
    value.get("error").and_then(Value::as_str).map(str::to_owned)
}

fn preview(text: &str) -> String {
    text.chars().take(OUTPUT_PREVIEW_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_parsed_from_clean_output() {
        let result = interpret_output(
            true,
            Some(0),
            r#"{"isFlower":true,"confidence":0.91,"class":"Flower","score":0.91}"#,
            "",
        )
        .unwrap();
        assert!(result.is_flower);
        assert_eq!(result.class_name, "Flower");
    }

    #[test]
    fn log_lines_before_verdict_are_tolerated() {
        let stdout = "loading model...\n{\"isFlower\":false,\"confidence\":0.7,\"class\":\"Not Flower\",\"score\":0.3}\n";
        let result = interpret_output(true, Some(0), stdout, "").unwrap();
        assert!(!result.is_flower);
    }

    #[test]
    fn error_field_is_a_classifier_error() {
        let err = interpret_output(
            true,
            Some(0),
            r#"{"error":"Model not found","isFlower":false,"confidence":0,"class":"Error"}"#,
            "",
        )
        .unwrap_err();
        assert_eq!(err, PollenError::Classifier("Model not found".into()));
    }

    #[test]
    fn failed_exit_prefers_json_error_then_stderr() {
        let err = interpret_output(false, Some(1), r#"{"error":"bad image"}"#, "Traceback").unwrap_err();
        assert_eq!(err, PollenError::Classifier("bad image".into()));

        let err = interpret_output(false, Some(2), "", "Traceback: boom").unwrap_err();
        assert!(matches!(err, PollenError::Classifier(msg) if msg.contains("boom") && msg.contains('2')));
    }

    #[test]
    fn empty_or_garbage_output_is_protocol_error() {
        assert!(matches!(
            interpret_output(true, Some(0), "  \n", ""),
            Err(PollenError::Protocol(_))
        ));
        assert!(matches!(
            interpret_output(true, Some(0), "not json", ""),
            Err(PollenError::Protocol(_))
        ));
        assert!(matches!(
            interpret_output(true, Some(0), r#"{"isFlower":"yes"}"#, ""),
            Err(PollenError::Protocol(_))
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::fs;
        use tempfile::TempDir;

        /// Lay out a fake classifier script and model; run it with `bash`.
        fn fixture(script_body: &str) -> (TempDir, ProcessClassifier) {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("classify_flower.sh");
            let model = dir.path().join("flower_classifier_model.h5");
            fs::write(&script, script_body).unwrap();
            fs::write(&model, b"weights").unwrap();
            let config = ProcessClassifierConfig::new(&script, &model).with_interpreter("bash");
            (dir, ProcessClassifier::new(config))
        }

        #[tokio::test]
        async fn available_when_artifacts_and_interpreter_present() {
            let (_dir, classifier) = fixture("cat > /dev/null\n");
            assert!(classifier.is_available().await);
        }

        #[tokio::test]
        async fn missing_model_is_unavailable() {
            let (dir, classifier) = fixture("cat > /dev/null\n");
            fs::remove_file(dir.path().join("flower_classifier_model.h5")).unwrap();

            assert!(!classifier.is_available().await);
            assert!(matches!(
                classifier.classify(b"img").await,
                Err(PollenError::ClassifierUnavailable(_))
            ));
        }

        #[tokio::test]
        async fn missing_interpreter_is_unavailable() {
            let (_dir, classifier) = fixture("cat > /dev/null\n");
            let classifier = ProcessClassifier::new(
                classifier
                    .config()
                    .clone()
                    .with_interpreter("definitely-not-an-interpreter-4242"),
            );

            assert!(!classifier.is_available().await);
            assert!(matches!(
                classifier.classify(b"img").await,
                Err(PollenError::ClassifierUnavailable(_))
            ));
        }

        #[tokio::test]
        async fn image_arrives_base64_encoded_with_json_flag() {
            let script = r#"
payload=$(cat)
if [ "$1" = "--json" ] && [ "$2" = "--model" ] && [ "$payload" = "aGVsbG8=" ]; then
  echo '{"isFlower":true,"confidence":0.95,"class":"Flower","score":0.95}'
else
  echo "{\"error\":\"unexpected invocation: $1 $2 $payload\"}"
fi
"#;
            let (_dir, classifier) = fixture(script);
            let result = classifier.classify(b"hello").await.unwrap();
            assert!(result.is_flower);
            assert!((result.confidence - 0.95).abs() < f64::EPSILON);
        }

        #[tokio::test]
        async fn nonzero_exit_reports_stderr() {
            let (_dir, classifier) = fixture("cat > /dev/null\necho 'tensorflow exploded' >&2\nexit 3\n");
            let err = classifier.classify(b"img").await.unwrap_err();
            assert!(matches!(err, PollenError::Classifier(msg) if msg.contains("tensorflow exploded")));
        }

        #[tokio::test]
        async fn hung_classifier_times_out() {
            let (_dir, classifier) = fixture("sleep 5\n");
            let classifier = ProcessClassifier::new(
                classifier
                    .config()
                    .clone()
                    .with_classify_timeout(Duration::from_millis(200)),
            );
            let err = classifier.classify(b"img").await.unwrap_err();
            assert!(matches!(err, PollenError::Classifier(msg) if msg.contains("no verdict")));
        }
    }
}
