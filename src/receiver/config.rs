//! Per-session receiver configuration

use std::fmt::Write as _;
use std::path::PathBuf;

/// Where the receiver sends decoded audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputMode {
    /// Raw PCM into a named pipe
    Pipe,
    /// A local sound device; never used by the bridge itself
    Alsa { device: String },
}

impl OutputMode {
    fn backend(&self) -> &'static str {
        match self {
            OutputMode::Pipe => "pipe",
            OutputMode::Alsa { .. } => "alsa",
        }
    }
}

/// Everything one receiver instance needs to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    /// Name advertised to AirPlay sources
    pub name: String,
    pub port: u16,
    pub output_mode: OutputMode,
    pub config_path: PathBuf,
    pub audio_pipe: PathBuf,
    pub metadata_pipe: PathBuf,
}

impl ReceiverConfig {
    /// Render the receiver's config file
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "general = {{");
        let _ = writeln!(out, "  name = \"{}\";", escape(&self.name));
        let _ = writeln!(out, "  port = {};", self.port);
        let _ = writeln!(out, "  output_backend = \"{}\";", self.output_mode.backend());
        let _ = writeln!(out, "  drift_tolerance_in_seconds = 0.002;");
        let _ = writeln!(out, "  resync_threshold_in_seconds = 0.050;");
        let _ = writeln!(out, "  ignore_volume_control = \"no\";");
        let _ = writeln!(out, "}};");
        let _ = writeln!(out);

        let _ = writeln!(out, "sessioncontrol = {{");
        let _ = writeln!(out, "  wait_for_completion = \"no\";");
        let _ = writeln!(out, "}};");
        let _ = writeln!(out);

        match &self.output_mode {
            OutputMode::Pipe => {
                let _ = writeln!(out, "pipe = {{");
                let _ = writeln!(out, "  name = \"{}\";", escape(&self.audio_pipe.display().to_string()));
                let _ = writeln!(out, "}};");
            }
            OutputMode::Alsa { device } => {
                let _ = writeln!(out, "alsa = {{");
                let _ = writeln!(out, "  output_device = \"{}\";", escape(device));
                let _ = writeln!(out, "}};");
            }
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "metadata = {{");
        let _ = writeln!(out, "  enabled = \"yes\";");
        let _ = writeln!(out, "  include_cover_art = \"no\";");
        let _ = writeln!(
            out,
            "  pipe_name = \"{}\";",
            escape(&self.metadata_pipe.display().to_string())
        );
        let _ = writeln!(out, "}};");

        out
    }

    /// Write the rendered config to `config_path`
    pub async fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.config_path, self.render()).await
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
