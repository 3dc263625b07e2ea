use std::path::{Path, PathBuf};

use mediaflow_core::execution::CommandSpec;
use mediaflow_core::models::{InputSource, TaskError, ToolSettings, UploadReceipt};
use mediaflow_core::orchestration::{
    Abort, BuiltCommand, CollaboratorFuture, CommandBuilder, DownloadRequest, Downloader,
    UploadRequest, Uploader,
};

/// Copies local input files into the task workspace.
pub struct LocalFileDownloader;

impl Downloader for LocalFileDownloader {
    fn download<'a>(
        &'a self,
        request: DownloadRequest,
    ) -> CollaboratorFuture<'a, Result<Vec<PathBuf>, Abort>> {
        Box::pin(async move {
            let sources = local_paths(&request.input)?;
            let total = sources.len();
            let mut copied = Vec::with_capacity(total);

            for (index, source) in sources.iter().enumerate() {
                if request.cancellation.is_cancelled() {
                    return Err(Abort::Cancelled);
                }

                let file_name = source.file_name().ok_or_else(|| {
                    TaskError::download(format!("'{}' is not a file path", source.display()))
                })?;
                // Prefix with the position so batch inputs with equal names stay distinct.
                let target = request
                    .target_dir
                    .join(format!("{index:02}_{}", file_name.to_string_lossy()));

                tokio::fs::copy(source, &target).await.map_err(|error| {
                    TaskError::download(format!("could not read '{}': {error}", source.display()))
                })?;

                request.progress.report(
                    (index + 1) as f64 * 100.0 / total as f64,
                    Some(&format!("fetched {}/{total}", index + 1)),
                );
                copied.push(target);
            }

            Ok(copied)
        })
    }
}

fn local_paths(input: &InputSource) -> Result<Vec<PathBuf>, TaskError> {
    match input {
        InputSource::LocalPath(path) => Ok(vec![path.clone()]),
        InputSource::Batch(items) => {
            let mut paths = Vec::new();
            for item in items {
                paths.extend(local_paths(item)?);
            }
            Ok(paths)
        }
        InputSource::Url(_) | InputSource::ChatFile { .. } => Err(TaskError::download(format!(
            "'{}' is not available offline; pass a local file",
            input.display_name()
        ))),
    }
}

/// Expands an argv template for every tool.
///
/// `{input}` becomes the first input, `{inputs}` expands to one argument per
/// input and `{output}` is the file the engine must write.
pub struct TemplateCommandBuilder {
    program: String,
    template: Vec<String>,
    output_name: String,
}

impl TemplateCommandBuilder {
    pub fn new(program: impl Into<String>, template: Vec<String>, output_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            template,
            output_name: output_name.into(),
        }
    }
}

impl CommandBuilder for TemplateCommandBuilder {
    fn build(
        &self,
        settings: &ToolSettings,
        inputs: &[PathBuf],
        work_dir: &Path,
    ) -> Result<BuiltCommand, TaskError> {
        let kind = settings.kind();
        if inputs.len() < kind.min_inputs() {
            return Err(TaskError::processing(format!(
                "'{kind}' needs at least {} inputs, got {}",
                kind.min_inputs(),
                inputs.len()
            )));
        }

        let output = work_dir.join(&self.output_name);
        let first = inputs
            .first()
            .map(|path| path.display().to_string())
            .unwrap_or_default();

        let mut args = Vec::with_capacity(self.template.len() + inputs.len());
        for arg in &self.template {
            match arg.as_str() {
                "{inputs}" => args.extend(inputs.iter().map(|path| path.display().to_string())),
                _ => args.push(
                    arg.replace("{input}", &first)
                        .replace("{output}", &output.display().to_string()),
                ),
            }
        }

        Ok(BuiltCommand {
            command: CommandSpec::new(&self.program).args(args),
            output,
        })
    }
}

/// Moves finished output into a local directory.
pub struct DirectoryUploader;

impl Uploader for DirectoryUploader {
    fn upload<'a>(
        &'a self,
        request: UploadRequest,
    ) -> CollaboratorFuture<'a, Result<UploadReceipt, Abort>> {
        Box::pin(async move {
            if request.cancellation.is_cancelled() {
                return Err(Abort::Cancelled);
            }

            let target_dir = PathBuf::from(&request.settings.target);
            tokio::fs::create_dir_all(&target_dir).await.map_err(|error| {
                TaskError::upload(format!("could not create '{}': {error}", target_dir.display()))
            })?;

            let file_name = match &request.settings.file_name {
                Some(name) => PathBuf::from(name),
                None => request
                    .file
                    .file_name()
                    .map(PathBuf::from)
                    .ok_or_else(|| TaskError::upload("engine output has no file name"))?,
            };
            let destination = target_dir.join(file_name);

            let final_size = tokio::fs::copy(&request.file, &destination)
                .await
                .map_err(|error| {
                    TaskError::upload(format!(
                        "could not write '{}': {error}",
                        destination.display()
                    ))
                })?;
            request.progress.report(100.0, None);

            Ok(UploadReceipt {
                success: true,
                final_size,
                destination: Some(destination.display().to_string()),
            })
        })
    }
}
