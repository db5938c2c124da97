//! Runner wiring parsed arguments to the exporter

use crate::cli::args::Args;
use crate::config::ExportConfig;
use crate::error::Result;
use crate::image::exporter::{ExportRequest, ExportSummary, ImageExporter};
use crate::logging::Logger;

pub struct Runner {
    args: Args,
    output: Logger,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let output = if args.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(args.verbose)
        };

        Self { args, output }
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    pub async fn run(&self) -> Result<ExportSummary> {
        self.args.validate()?;

        let reference = self.args.image_reference()?;
        let credentials = self.args.auth_config()?;
        let config = self.args.export_config(ExportConfig::from_env())?;
        let output_path = self.args.output_path(&reference);

        self.output.info(&format!("Image: {}", reference));
        self.output.info(&format!("Output: {}", output_path.display()));
        if let Some(credentials) = &credentials {
            self.output.verbose(&format!("Using credentials for {}", credentials.username));
        }

        let exporter = ImageExporter::new(config, self.output.clone())?;
        let request = ExportRequest::new(reference, output_path).with_credentials(credentials);
        let summary = exporter.export(&request).await?;

        self.output.info(&format!("Manifest: {}", summary.manifest_digest));
        self.output.info(&format!("Image ID: {}", summary.archive.image_id));
        self.output.info(&format!(
            "Layers: {}, downloaded {}, archive {}",
            summary.archive.layer_ids.len(),
            self.output.format_size(summary.downloaded_bytes),
            self.output.format_size(summary.archive.bytes_written)
        ));
        match &summary.repo_tag {
            Some(repo_tag) => self.output.info(&format!(
                "Load with: docker load -i {}  ({})",
                summary.archive.path.display(),
                repo_tag
            )),
            None => self.output.info(&format!(
                "Load with: docker load -i {}  (untagged, digest reference)",
                summary.archive.path.display()
            )),
        }

        Ok(summary)
    }
}
