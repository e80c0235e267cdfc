//! Structured argument builder for the transcoder.
//!
//! Arguments are assembled from an allow-listed [`Flag`] set and typed
//! [`Value`]s. There is no way to append a raw string: numbers are formatted
//! from integers, paths are absolute and carry the `file:` protocol prefix
//! (so they can never look like an option or a URL), and free text only
//! appears as the value half of `key=value` metadata. Nothing goes through a
//! shell.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use transforge_common::{AudioCodec, Error, Result, TransformParams, VideoCodec};

/// Options the service is allowed to pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    HideBanner,
    NoStdin,
    NoStats,
    Overwrite,
    LogLevel,
    Progress,
    Input,
    VideoCodec,
    AudioCodec,
    NoAudio,
    VideoBitrate,
    AudioBitrate,
    Crf,
    Preset,
    VideoFilter,
    Metadata,
    Format,
}

impl Flag {
    pub fn as_str(self) -> &'static str {
        match self {
            Flag::HideBanner => "-hide_banner",
            Flag::NoStdin => "-nostdin",
            Flag::NoStats => "-nostats",
            Flag::Overwrite => "-y",
            Flag::LogLevel => "-loglevel",
            Flag::Progress => "-progress",
            Flag::Input => "-i",
            Flag::VideoCodec => "-c:v",
            Flag::AudioCodec => "-c:a",
            Flag::NoAudio => "-an",
            Flag::VideoBitrate => "-b:v",
            Flag::AudioBitrate => "-b:a",
            Flag::Crf => "-crf",
            Flag::Preset => "-preset",
            Flag::VideoFilter => "-vf",
            Flag::Metadata => "-metadata",
            Flag::Format => "-f",
        }
    }
}

/// Typed option values.
#[derive(Debug, Clone)]
pub enum Value<'a> {
    /// A fixed token from the codec/container tables.
    Token(&'static str),
    /// A bounded integer.
    Number(u32),
    /// A bitrate in kbit/s.
    Kbps(u32),
    /// Output scaling; a missing side keeps the aspect ratio.
    Scale { width: Option<u32>, height: Option<u32> },
    /// An absolute local path.
    Path(&'a Path),
    /// A `key=value` metadata pair with a fixed key.
    Metadata { key: &'static str, value: &'a str },
}

impl Value<'_> {
    fn render(&self) -> Result<OsString> {
        Ok(match self {
            Value::Token(t) => OsString::from(*t),
            Value::Number(n) => OsString::from(n.to_string()),
            Value::Kbps(n) => OsString::from(format!("{n}k")),
            Value::Scale { width, height } => {
                let side = |v: &Option<u32>| v.map_or_else(|| "-2".to_string(), |n| n.to_string());
                OsString::from(format!("scale={}:{}", side(width), side(height)))
            }
            Value::Path(p) => {
                if !p.is_absolute() {
                    return Err(Error::internal("transcoder paths must be absolute"));
                }
                let mut s = OsString::from("file:");
                s.push(p.as_os_str());
                s
            }
            Value::Metadata { key, value } => OsString::from(format!("{key}={value}")),
        })
    }
}

/// An ffmpeg invocation under construction.
#[derive(Debug, Clone)]
pub struct TransformCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl TransformCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append a flag that takes no value.
    pub fn flag(&mut self, flag: Flag) -> &mut Self {
        self.args.push(flag.as_str().into());
        self
    }

    /// Append a flag followed by its value.
    pub fn option(&mut self, flag: Flag, value: Value<'_>) -> Result<&mut Self> {
        let rendered = value.render()?;
        self.args.push(flag.as_str().into());
        self.args.push(rendered);
        Ok(self)
    }

    /// Build the full argument list for transforming `input` into `output`.
    pub fn for_transform(
        program: impl Into<PathBuf>,
        input: &Path,
        output: &Path,
        params: &TransformParams,
    ) -> Result<Self> {
        let mut cmd = Self::new(program);
        cmd.flag(Flag::HideBanner)
            .flag(Flag::NoStdin)
            .flag(Flag::NoStats)
            .flag(Flag::Overwrite);
        cmd.option(Flag::LogLevel, Value::Token("error"))?;
        cmd.option(Flag::Progress, Value::Token("pipe:1"))?;
        cmd.option(Flag::Input, Value::Path(input))?;

        cmd.option(Flag::VideoCodec, Value::Token(params.video_codec.encoder()))?;
        if params.video_codec != VideoCodec::Copy {
            if let Some(preset) = params.preset {
                cmd.option(Flag::Preset, Value::Token(preset.as_str()))?;
            }
            if let Some(crf) = params.crf {
                cmd.option(Flag::Crf, Value::Number(crf))?;
            }
            if let Some(kbps) = params.video_bitrate_kbps {
                cmd.option(Flag::VideoBitrate, Value::Kbps(kbps))?;
            }
            if params.width.is_some() || params.height.is_some() {
                cmd.option(
                    Flag::VideoFilter,
                    Value::Scale {
                        width: params.width,
                        height: params.height,
                    },
                )?;
            }
        }

        match params.audio_codec.encoder() {
            Some(encoder) => {
                cmd.option(Flag::AudioCodec, Value::Token(encoder))?;
                if let Some(kbps) = params.audio_bitrate_kbps {
                    if !matches!(params.audio_codec, AudioCodec::Copy | AudioCodec::Flac) {
                        cmd.option(Flag::AudioBitrate, Value::Kbps(kbps))?;
                    }
                }
            }
            None => {
                cmd.flag(Flag::NoAudio);
            }
        }

        if let Some(title) = &params.title {
            cmd.option(
                Flag::Metadata,
                Value::Metadata {
                    key: "title",
                    value: title,
                },
            )?;
        }

        cmd.option(Flag::Format, Value::Token(params.container.muxer()))?;

        let output = Value::Path(output).render()?;
        cmd.args.push(output);
        Ok(cmd)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Spawn with stdout (progress) and stderr piped and stdin closed. The
    /// child is killed if its handle is dropped.
    pub fn spawn(&self) -> Result<Child> {
        tracing::debug!(program = %self.program.display(), args = ?self.args, "Spawning transcoder");
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::transform(format!("failed to spawn transcoder: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transforge_common::{Container, Preset};

    fn args_of(cmd: &TransformCommand) -> Vec<String> {
        cmd.args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn default_transform_args() {
        let cmd = TransformCommand::for_transform(
            "ffmpeg",
            Path::new("/ws/input.mov"),
            Path::new("/ws/output.mp4"),
            &TransformParams::default(),
        )
        .unwrap();
        assert_eq!(
            args_of(&cmd),
            vec![
                "-hide_banner", "-nostdin", "-nostats", "-y",
                "-loglevel", "error",
                "-progress", "pipe:1",
                "-i", "file:/ws/input.mov",
                "-c:v", "libx264",
                "-c:a", "aac",
                "-f", "mp4",
                "file:/ws/output.mp4",
            ]
        );
    }

    #[test]
    fn full_params() {
        let params = TransformParams {
            container: Container::Mkv,
            video_codec: VideoCodec::Hevc,
            audio_codec: AudioCodec::None,
            crf: Some(22),
            preset: Some(Preset::Slow),
            width: Some(1280),
            title: Some("My Film".into()),
            ..Default::default()
        };
        let cmd = TransformCommand::for_transform(
            "ffmpeg",
            Path::new("/ws/in"),
            Path::new("/ws/out.mkv"),
            &params,
        )
        .unwrap();
        let args = args_of(&cmd);
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx265 -preset slow -crf 22 -vf scale=1280:-2"));
        assert!(joined.contains("-an"));
        assert!(!joined.contains("-c:a"));
        assert!(joined.contains("-metadata title=My Film"));
        assert!(joined.ends_with("-f matroska file:/ws/out.mkv"));
    }

    #[test]
    fn hostile_text_stays_one_argument() {
        let params = TransformParams {
            title: Some("x -f lavfi -i /etc/passwd; rm -rf /".into()),
            ..Default::default()
        };
        let cmd = TransformCommand::for_transform(
            "ffmpeg",
            Path::new("/ws/-i"),
            Path::new("/ws/out.mp4"),
            &params,
        )
        .unwrap();
        let args = args_of(&cmd);
        assert!(args.contains(&"title=x -f lavfi -i /etc/passwd; rm -rf /".to_string()));
        assert!(args.contains(&"file:/ws/-i".to_string()));
        // Exactly one input flag.
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 1);
    }

    #[test]
    fn relative_paths_rejected() {
        let res = TransformCommand::for_transform(
            "ffmpeg",
            Path::new("input.mov"),
            Path::new("/ws/out.mp4"),
            &TransformParams::default(),
        );
        assert!(res.is_err());
    }
}
