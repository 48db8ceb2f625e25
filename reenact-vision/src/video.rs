//! Video decoding and encoding through `ffmpeg` / `ffprobe` child processes
//! exchanging raw RGB24 frames over pipes.

use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::VisionError;

/// What the pipeline needs to know about a driving video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// Container index of the stream that gets decoded.
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Container frame count, when the container records one.
    pub frame_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    index: usize,
    codec_type: String,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    disposition: FfprobeDisposition,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    attached_pic: u8,
}

fn tool(name: &'static str) -> Result<PathBuf> {
    which::which(name).map_err(|_| VisionError::ToolNotFound(name).into())
}

/// Parse ffprobe rates such as `30000/1001` or `25`.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

fn parse_probe(path: &Path, json: &[u8]) -> Result<VideoInfo> {
    let invalid = |reason: &str| VisionError::InvalidVideo {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let probe: FfprobeOutput = serde_json::from_slice(json).context("parsing ffprobe output")?;
    // Cover art shows up as a single-frame video stream.
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type == "video" && s.disposition.attached_pic == 0)
        .ok_or_else(|| invalid("no video stream"))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(invalid("missing frame size").into()),
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .ok_or_else(|| invalid("missing frame rate"))?;

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .filter(|&n| n > 0);

    Ok(VideoInfo {
        stream_index: stream.index,
        width,
        height,
        fps,
        frame_count,
    })
}

/// Read size, frame rate and frame count of the first video stream.
pub fn probe(path: &Path) -> Result<VideoInfo> {
    if !path.exists() {
        return Err(VisionError::InvalidVideo {
            path: path.to_path_buf(),
            reason: "file not found".to_string(),
        }
        .into());
    }

    let output = Command::new(tool("ffprobe")?)
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .context("running ffprobe")?;

    if !output.status.success() {
        return Err(VisionError::FfmpegFailed {
            message: format!("ffprobe exited with {}", output.status),
            stderr: Some(String::from_utf8_lossy(&output.stderr).into_owned()),
        }
        .into());
    }

    parse_probe(path, &output.stdout)
}

/// Reads a child's stderr on its own thread until the pipe closes.
struct StderrDrain(Option<JoinHandle<String>>);

impl StderrDrain {
    fn spawn(child: &mut Child) -> Self {
        let handle = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                pipe.read_to_end(&mut buf).ok();
                String::from_utf8_lossy(&buf).into_owned()
            })
        });
        Self(handle)
    }

    fn collect(&mut self) -> String {
        self.0
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

fn finish_child(mut child: Child, stderr: &mut StderrDrain, what: &str) -> Result<()> {
    let status = child.wait().with_context(|| format!("waiting for {}", what))?;
    let stderr = stderr.collect();
    if !status.success() {
        return Err(VisionError::FfmpegFailed {
            message: format!("{} exited with {}", what, status),
            stderr: Some(stderr),
        }
        .into());
    }
    if !stderr.trim().is_empty() {
        log::debug!("{}: {}", what, stderr.trim());
    }
    Ok(())
}

/// Decoded frames of a video file, in order.
pub struct VideoReader {
    child: Option<Child>,
    stdout: ChildStdout,
    stderr: StderrDrain,
    width: u32,
    height: u32,
    done: bool,
}

impl VideoReader {
    pub fn open(path: &Path, info: &VideoInfo) -> Result<Self> {
        Self::spawn(Command::new(tool("ffmpeg")?), path, info)
    }

    fn spawn(mut command: Command, path: &Path, info: &VideoInfo) -> Result<Self> {
        let mut child = command
            .args(["-v", "error", "-nostdin", "-noautorotate", "-i"])
            .arg(path)
            .args(["-map", &format!("0:{}", info.stream_index)])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning ffmpeg decoder")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg decoder has no stdout"))?;
        let stderr = StderrDrain::spawn(&mut child);

        log::debug!(
            "decoding {} stream {} at {}x{}",
            path.display(),
            info.stream_index,
            info.width,
            info.height
        );

        Ok(Self {
            child: Some(child),
            stdout,
            stderr,
            width: info.width,
            height: info.height,
            done: false,
        })
    }

    fn reap(&mut self) -> Result<()> {
        match self.child.take() {
            Some(child) => finish_child(child, &mut self.stderr, "ffmpeg decoder"),
            None => Ok(()),
        }
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut buf = vec![0u8; (self.width * self.height * 3) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("reading decoded frame"),
            }
        }

        if filled == 0 {
            self.reap()?;
            return Ok(None);
        }
        if filled < buf.len() {
            self.reap()?;
            return Err(anyhow::anyhow!(
                "truncated frame: got {} of {} bytes",
                filled,
                buf.len()
            ));
        }

        RgbImage::from_raw(self.width, self.height, buf)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("failed to build frame buffer"))
    }
}

impl Iterator for VideoReader {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoReader {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            child.kill().ok();
            child.wait().ok();
        }
    }
}

/// Where synthesized frames go.
pub trait FrameSink {
    fn write(&mut self, frame: &RgbImage) -> Result<()>;
}

/// Collects frames in memory.
impl FrameSink for Vec<RgbImage> {
    fn write(&mut self, frame: &RgbImage) -> Result<()> {
        self.push(frame.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderOptions {
    pub codec: String,
    /// Fourcc tag written into the container, empty for the codec default.
    pub tag: String,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            codec: "mpeg4".to_string(),
            tag: "xvid".to_string(),
        }
    }
}

/// Encoder arguments for raw RGB24 frames arriving on stdin.
pub fn encoder_args(
    out: &Path,
    width: u32,
    height: u32,
    fps: f64,
    options: &EncoderOptions,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "-y",
        "-v",
        "error",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgb24",
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}x{}", width, height));
    args.push("-r".to_string());
    args.push(format!("{}", fps));
    args.extend(["-i", "-", "-c:v"].iter().map(|s| s.to_string()));
    args.push(options.codec.clone());
    if !options.tag.is_empty() {
        args.push("-vtag".to_string());
        args.push(options.tag.clone());
    }
    args.extend(["-pix_fmt", "yuv420p"].iter().map(|s| s.to_string()));
    args.push(out.to_string_lossy().into_owned());
    args
}

pub struct VideoWriter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: StderrDrain,
    out: PathBuf,
    width: u32,
    height: u32,
    frames: u64,
    finished: bool,
}

impl VideoWriter {
    pub fn create(
        out: &Path,
        width: u32,
        height: u32,
        fps: f64,
        options: &EncoderOptions,
    ) -> Result<Self> {
        Self::spawn(Command::new(tool("ffmpeg")?), out, width, height, fps, options)
    }

    fn spawn(
        mut command: Command,
        out: &Path,
        width: u32,
        height: u32,
        fps: f64,
        options: &EncoderOptions,
    ) -> Result<Self> {
        if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut child = command
            .args(encoder_args(out, width, height, fps, options))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning ffmpeg encoder")?;
        let stdin = child.stdin.take();
        let stderr = StderrDrain::spawn(&mut child);

        Ok(Self {
            child: Some(child),
            stdin,
            stderr,
            out: out.to_path_buf(),
            width,
            height,
            frames: 0,
            finished: false,
        })
    }

    fn reap(&mut self) -> Result<()> {
        drop(self.stdin.take());
        match self.child.take() {
            Some(child) => finish_child(child, &mut self.stderr, "ffmpeg encoder"),
            None => Ok(()),
        }
    }

    /// Flush, close the pipe and wait for the encoder. Returns frames written.
    pub fn finish(mut self) -> Result<u64> {
        self.reap()?;
        self.finished = true;
        Ok(self.frames)
    }
}

impl FrameSink for VideoWriter {
    fn write(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            anyhow::bail!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            );
        }
        let written = match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(frame.as_raw()),
            None => anyhow::bail!("encoder already closed"),
        };
        if let Err(e) = written {
            // An encoder that died early explains itself on stderr.
            self.reap()?;
            return Err(e).context("writing frame to ffmpeg");
        }
        self.frames += 1;
        Ok(())
    }
}

/// An unfinished writer leaves no partial file behind.
impl Drop for VideoWriter {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            child.kill().ok();
            child.wait().ok();
        }
        if !self.finished && self.out.exists() {
            log::debug!("removing incomplete {}", self.out.display());
            std::fs::remove_file(&self.out).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 1e-2);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_parse_probe() {
        let json = br#"{
            "streams": [
                {"index": 0, "codec_type": "audio"},
                {"index": 1, "codec_type": "video", "width": 640, "height": 360,
                 "r_frame_rate": "30/1", "avg_frame_rate": "0/0", "nb_frames": "120"}
            ]
        }"#;
        let info = parse_probe(Path::new("clip.mp4"), json).unwrap();
        assert_eq!(
            info,
            VideoInfo {
                stream_index: 1,
                width: 640,
                height: 360,
                fps: 30.0,
                frame_count: Some(120),
            }
        );
    }

    #[test]
    fn test_parse_probe_skips_cover_art() {
        let json = br#"{
            "streams": [
                {"index": 0, "codec_type": "video", "width": 600, "height": 600,
                 "r_frame_rate": "90000/1", "avg_frame_rate": "0/0",
                 "disposition": {"default": 0, "attached_pic": 1}},
                {"index": 1, "codec_type": "audio"},
                {"index": 2, "codec_type": "video", "width": 320, "height": 240,
                 "r_frame_rate": "25/1", "avg_frame_rate": "25/1",
                 "disposition": {"default": 1, "attached_pic": 0}}
            ]
        }"#;
        let info = parse_probe(Path::new("clip.mkv"), json).unwrap();
        assert_eq!(info.stream_index, 2);
        assert_eq!((info.width, info.height), (320, 240));

        let only_cover = br#"{"streams": [{"index": 0, "codec_type": "video",
            "width": 600, "height": 600, "avg_frame_rate": "1/1",
            "disposition": {"attached_pic": 1}}]}"#;
        assert!(parse_probe(Path::new("song.m4a"), only_cover).is_err());
    }

    #[test]
    fn test_parse_probe_without_video() {
        let json = br#"{"streams": [{"codec_type": "audio"}]}"#;
        let err = parse_probe(Path::new("song.mp3"), json).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::InvalidVideo { .. })
        ));
    }

    #[test]
    fn test_encoder_args() {
        let args = encoder_args(
            Path::new("out/2.mp4"),
            256,
            256,
            25.0,
            &EncoderOptions::default(),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-s 256x256 -r 25 -i -"));
        assert!(joined.contains("-c:v mpeg4 -vtag xvid"));
        assert_eq!(args.last().map(String::as_str), Some("out/2.mp4"));

        let plain = EncoderOptions {
            codec: "libx264".to_string(),
            tag: String::new(),
        };
        let args = encoder_args(Path::new("a.mp4"), 256, 256, 30.0, &plain);
        assert!(!args.iter().any(|a| a == "-vtag"));
    }

    #[test]
    fn test_missing_tool() {
        let err = tool("reenact-no-such-tool").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VisionError>(),
            Some(VisionError::ToolNotFound("reenact-no-such-tool"))
        ));
    }

    /// `sh` running `body` in place of ffmpeg; the real arguments land in `$@`.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &tempfile::TempDir, body: &str) -> Command {
        let script = dir.path().join("ffmpeg.sh");
        std::fs::write(&script, format!("{}\n", body)).unwrap();
        let mut command = Command::new("sh");
        command.arg(script);
        command
    }

    #[cfg(unix)]
    fn tiny_info() -> VideoInfo {
        VideoInfo {
            stream_index: 0,
            width: 2,
            height: 2,
            fps: 25.0,
            frame_count: None,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_decoder_survives_noisy_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(
            &dir,
            r"head -c 300000 /dev/zero | tr '\0' 'x' >&2
printf '\377\377\377\000\000\000\377\377\377\000\000\000'",
        );
        let mut reader = VideoReader::spawn(ffmpeg, Path::new("in.mp4"), &tiny_info()).unwrap();

        let frame = reader.next().unwrap().unwrap();
        assert_eq!(frame.dimensions(), (2, 2));
        assert_eq!(frame.get_pixel(0, 0), &image::Rgb([255, 255, 255]));
        assert_eq!(frame.get_pixel(1, 0), &image::Rgb([0, 0, 0]));
        assert!(reader.next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_decoder_maps_probed_stream() {
        let dir = tempfile::tempdir().unwrap();
        let args = dir.path().join("args");
        let ffmpeg = fake_ffmpeg(&dir, &format!("echo \"$@\" > {}", args.display()));
        let info = VideoInfo {
            stream_index: 3,
            ..tiny_info()
        };
        let mut reader = VideoReader::spawn(ffmpeg, Path::new("in.mkv"), &info).unwrap();

        assert!(reader.next().is_none());
        let args = std::fs::read_to_string(args).unwrap();
        assert!(args.contains("-i in.mkv -map 0:3"));
    }

    #[cfg(unix)]
    #[test]
    fn test_decoder_truncated_frame() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(&dir, "printf 'abcde'");
        let mut reader = VideoReader::spawn(ffmpeg, Path::new("in.mp4"), &tiny_info()).unwrap();

        let err = reader.next().unwrap().unwrap_err();
        assert!(err.to_string().contains("truncated frame: got 5 of 12 bytes"));
        assert!(reader.next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_decoder_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = fake_ffmpeg(&dir, "echo 'moov atom not found' >&2; exit 1");
        let mut reader = VideoReader::spawn(ffmpeg, Path::new("in.mp4"), &tiny_info()).unwrap();

        let err = reader.next().unwrap().unwrap_err();
        match err.downcast_ref::<VisionError>() {
            Some(VisionError::FfmpegFailed { stderr, .. }) => {
                assert!(stderr.as_deref().unwrap_or("").contains("moov atom not found"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_encoder_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let ffmpeg = fake_ffmpeg(&dir, r#"for last; do :; done; cat > "$last""#);
        let mut writer =
            VideoWriter::spawn(ffmpeg, &out, 2, 2, 25.0, &EncoderOptions::default()).unwrap();

        let frame = RgbImage::from_pixel(2, 2, image::Rgb([1, 2, 3]));
        writer.write(&frame).unwrap();
        writer.write(&frame).unwrap();
        assert_eq!(writer.finish().unwrap(), 2);
        assert_eq!(std::fs::read(&out).unwrap().len(), 24);
    }

    #[cfg(unix)]
    #[test]
    fn test_encoder_exit_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.mp4");
        let ffmpeg = fake_ffmpeg(
            &dir,
            r#"for last; do :; done; echo partial > "$last"
echo "Unknown encoder 'bogus'" >&2; exit 1"#,
        );
        let mut writer =
            VideoWriter::spawn(ffmpeg, &out, 64, 64, 25.0, &EncoderOptions::default()).unwrap();

        let frame = RgbImage::new(64, 64);
        let err = (0..1000)
            .find_map(|_| writer.write(&frame).err())
            .expect("encoder never refused a frame");
        match err.downcast_ref::<VisionError>() {
            Some(VisionError::FfmpegFailed { stderr, .. }) => {
                assert!(stderr.as_deref().unwrap_or("").contains("Unknown encoder 'bogus'"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        drop(writer);
        assert!(!out.exists());
    }
}
