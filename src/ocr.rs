//! Optical character recognition for scanned pages and images.
//!
//! OCR is only ever a fallback: the PDF extractor calls it for pages whose
//! native text layer is too thin, and images have no other text source.
//! [`TesseractCli`] drives the `tesseract` binary (and `pdftoppm` to rasterize
//! PDF pages). A missing or hung binary surfaces as
//! [`ExtractError::OcrUnavailable`], which the pipeline retries.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ParserConfig;
use crate::extract::ExtractError;

/// Text recognition over raw image or PDF bytes. Implementations block.
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Recognize text in an encoded image (PNG, JPEG, TIFF, ...).
    fn recognize_image(&self, image: &[u8]) -> Result<String, ExtractError>;

    /// Recognize text on one page (1-based) of a PDF.
    fn recognize_pdf_page(&self, pdf: &[u8], page: usize) -> Result<String, ExtractError>;
}

/// Builds the engine selected by `[parser]`.
pub fn create_engine(config: &ParserConfig) -> Arc<dyn OcrEngine> {
    if config.ocr_enabled {
        Arc::new(TesseractCli::from_config(config))
    } else {
        Arc::new(DisabledOcr)
    }
}

/// Used when OCR is switched off: recognizes nothing.
pub struct DisabledOcr;

impl OcrEngine for DisabledOcr {
    fn name(&self) -> &str {
        "disabled"
    }

    fn recognize_image(&self, _image: &[u8]) -> Result<String, ExtractError> {
        Ok(String::new())
    }

    fn recognize_pdf_page(&self, _pdf: &[u8], _page: usize) -> Result<String, ExtractError> {
        Ok(String::new())
    }
}

pub struct TesseractCli {
    command: String,
    rasterize_command: String,
    languages: String,
    timeout: Duration,
}

impl TesseractCli {
    pub fn from_config(config: &ParserConfig) -> Self {
        Self {
            command: config.ocr_command.clone(),
            rasterize_command: config.rasterize_command.clone(),
            languages: config.ocr_languages.clone(),
            timeout: Duration::from_secs(config.ocr_timeout_secs),
        }
    }

    fn recognize_file(&self, input: &Path, workdir: &Path) -> Result<String, ExtractError> {
        // tesseract appends ".txt" to the output base.
        let out_base = workdir.join("ocr-out");
        let mut cmd = Command::new(&self.command);
        cmd.arg(input).arg(&out_base).arg("-l").arg(&self.languages);
        run_with_timeout(cmd, &self.command, self.timeout)?;

        let text_path = out_base.with_extension("txt");
        let bytes = std::fs::read(&text_path).map_err(|e| {
            ExtractError::Ocr(format!("{} produced no output: {}", self.command, e))
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl OcrEngine for TesseractCli {
    fn name(&self) -> &str {
        &self.command
    }

    fn recognize_image(&self, image: &[u8]) -> Result<String, ExtractError> {
        let dir = scratch_dir()?;
        let input = dir.path().join("input.img");
        std::fs::write(&input, image).map_err(scratch_error)?;
        self.recognize_file(&input, dir.path())
    }

    fn recognize_pdf_page(&self, pdf: &[u8], page: usize) -> Result<String, ExtractError> {
        let dir = scratch_dir()?;
        let input = dir.path().join("input.pdf");
        std::fs::write(&input, pdf).map_err(scratch_error)?;

        let page_arg = page.to_string();
        let prefix = dir.path().join("page");
        let mut cmd = Command::new(&self.rasterize_command);
        cmd.args(["-f", &page_arg, "-l", &page_arg, "-r", "300", "-png"])
            .arg(&input)
            .arg(&prefix);
        run_with_timeout(cmd, &self.rasterize_command, self.timeout)?;

        let image = find_rendered_page(dir.path())?;
        self.recognize_file(&image, dir.path())
    }
}

fn scratch_dir() -> Result<tempfile::TempDir, ExtractError> {
    tempfile::Builder::new()
        .prefix("kh-ocr-")
        .tempdir()
        .map_err(scratch_error)
}

fn scratch_error(err: std::io::Error) -> ExtractError {
    ExtractError::OcrUnavailable(format!("OCR scratch space unavailable: {}", err))
}

/// pdftoppm names its output `page-<n>.png` with a zero-padded page number
/// whose width depends on the document's page count.
fn find_rendered_page(dir: &Path) -> Result<PathBuf, ExtractError> {
    let entries = std::fs::read_dir(dir).map_err(scratch_error)?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("page") && name.ends_with(".png") {
            return Ok(path);
        }
    }
    Err(ExtractError::Ocr("page rasterization produced no image".to_string()))
}

/// Runs `cmd` to completion or kills it at `timeout`. A binary that cannot
/// be started or does not finish in time is reported as unavailable.
fn run_with_timeout(mut cmd: Command, program: &str, timeout: Duration) -> Result<(), ExtractError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| ExtractError::OcrUnavailable(format!("cannot start {}: {}", program, e)))?;

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => {
                return Err(ExtractError::Ocr(format!("{} exited with {}", program, status)));
            }
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ExtractError::OcrUnavailable(format!(
                    "{} timed out after {}s",
                    program,
                    timeout.as_secs()
                )));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                return Err(ExtractError::OcrUnavailable(format!(
                    "waiting for {} failed: {}",
                    program, e
                )));
            }
        }
    }
}
