//! Bounds on numeric encoding parameters and codec/container pairing.
//!
//! Every number that ends up in the transcoder's argument list passes
//! through here first, so the formatted value always fits the range the
//! tool accepts.

use transforge_common::{AudioCodec, Container, TransformParams, ValidationError, VideoCodec};

use super::filename::{validate_filename, validate_metadata_value};

pub const VIDEO_BITRATE_KBPS: (u64, u64) = (64, 200_000);
pub const AUDIO_BITRATE_KBPS: (u64, u64) = (16, 1_024);
pub const WIDTH: (u64, u64) = (16, 7_680);
pub const HEIGHT: (u64, u64) = (16, 4_320);
/// CRF scale for x264/x265.
pub const CRF_X26X: (u64, u64) = (0, 51);
/// CRF scale for VP9/AV1.
pub const CRF_WIDE: (u64, u64) = (0, 63);

fn check_range(
    field: &'static str,
    value: Option<u32>,
    (min, max): (u64, u64),
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !(min..=max).contains(&u64::from(v)) => Err(ValidationError::OutOfRange {
            field,
            value: u64::from(v),
            min,
            max,
        }),
        _ => Ok(()),
    }
}

/// Validate free-text fields of the parameters (title, output name).
pub fn validate_text_fields(params: &TransformParams) -> Result<(), ValidationError> {
    if let Some(name) = &params.output_name {
        validate_filename(name)?;
    }
    if let Some(title) = &params.title {
        validate_metadata_value("title", title)?;
    }
    Ok(())
}

/// Validate numeric bounds and codec combinations.
pub fn validate_numeric(params: &TransformParams) -> Result<(), ValidationError> {
    check_range("video_bitrate_kbps", params.video_bitrate_kbps, VIDEO_BITRATE_KBPS)?;
    check_range("audio_bitrate_kbps", params.audio_bitrate_kbps, AUDIO_BITRATE_KBPS)?;
    check_range("width", params.width, WIDTH)?;
    check_range("height", params.height, HEIGHT)?;

    let crf_range = match params.video_codec {
        VideoCodec::H264 | VideoCodec::Hevc => CRF_X26X,
        VideoCodec::Vp9 | VideoCodec::Av1 | VideoCodec::Copy => CRF_WIDE,
    };
    check_range("crf", params.crf, crf_range)?;

    for (field, value) in [("width", params.width), ("height", params.height)] {
        if value.is_some_and(|v| v % 2 != 0) {
            return Err(ValidationError::Unsupported(format!("{field} must be even")));
        }
    }

    if params.video_codec == VideoCodec::Copy {
        let reencode = params.width.is_some()
            || params.height.is_some()
            || params.crf.is_some()
            || params.video_bitrate_kbps.is_some()
            || params.preset.is_some();
        if reencode {
            return Err(ValidationError::Unsupported(
                "scaling, crf, bitrate and preset require a video encoder other than copy".into(),
            ));
        }
    }
    if params.crf.is_some() && params.video_bitrate_kbps.is_some() {
        return Err(ValidationError::Unsupported(
            "crf and video_bitrate_kbps are mutually exclusive".into(),
        ));
    }
    if matches!(params.audio_codec, AudioCodec::Copy | AudioCodec::None | AudioCodec::Flac)
        && params.audio_bitrate_kbps.is_some()
    {
        return Err(ValidationError::Unsupported(
            "audio_bitrate_kbps requires a lossy audio encoder".into(),
        ));
    }

    if params.container == Container::Webm {
        let video_ok = matches!(params.video_codec, VideoCodec::Vp9 | VideoCodec::Av1);
        let audio_ok = matches!(params.audio_codec, AudioCodec::Opus | AudioCodec::None);
        if !video_ok || !audio_ok {
            return Err(ValidationError::Unsupported(
                "webm requires vp9/av1 video and opus audio".into(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        let params = TransformParams::default();
        validate_numeric(&params).unwrap();
        validate_text_fields(&params).unwrap();
    }

    #[test]
    fn bitrate_upper_bound() {
        let params = TransformParams {
            video_bitrate_kbps: Some(u32::MAX),
            ..Default::default()
        };
        assert_matches!(
            validate_numeric(&params),
            Err(ValidationError::OutOfRange { field: "video_bitrate_kbps", max: 200_000, .. })
        );
    }

    #[test]
    fn dimensions() {
        let params = TransformParams {
            width: Some(1920),
            height: Some(1080),
            ..Default::default()
        };
        validate_numeric(&params).unwrap();

        let params = TransformParams {
            width: Some(100_000),
            ..Default::default()
        };
        assert_matches!(
            validate_numeric(&params),
            Err(ValidationError::OutOfRange { field: "width", .. })
        );

        let params = TransformParams {
            height: Some(721),
            ..Default::default()
        };
        assert_matches!(validate_numeric(&params), Err(ValidationError::Unsupported(_)));
    }

    #[test]
    fn crf_depends_on_codec() {
        let params = TransformParams {
            crf: Some(60),
            ..Default::default()
        };
        assert!(validate_numeric(&params).is_err());

        let params = TransformParams {
            crf: Some(60),
            video_codec: VideoCodec::Av1,
            ..Default::default()
        };
        validate_numeric(&params).unwrap();
    }

    #[test]
    fn copy_cannot_scale() {
        let params = TransformParams {
            video_codec: VideoCodec::Copy,
            width: Some(640),
            ..Default::default()
        };
        assert_matches!(validate_numeric(&params), Err(ValidationError::Unsupported(_)));
    }

    #[test]
    fn webm_pairing() {
        let params = TransformParams {
            container: Container::Webm,
            ..Default::default()
        };
        assert!(validate_numeric(&params).is_err());

        let params = TransformParams {
            container: Container::Webm,
            video_codec: VideoCodec::Vp9,
            audio_codec: AudioCodec::Opus,
            ..Default::default()
        };
        validate_numeric(&params).unwrap();
    }

    #[test]
    fn text_fields() {
        let params = TransformParams {
            output_name: Some("-filter_complex".into()),
            ..Default::default()
        };
        assert_matches!(
            validate_text_fields(&params),
            Err(ValidationError::InvalidFilename(_))
        );

        let params = TransformParams {
            title: Some("Title\r\n-f null".into()),
            ..Default::default()
        };
        assert_matches!(
            validate_text_fields(&params),
            Err(ValidationError::InvalidMetadata("title"))
        );
    }
}
