use crate::common::Point;
use crate::error::RemoteError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// JPEG-encoded region of interest submitted for refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    pub captured_ns: u64,
}

/// Landmarks from the remote detector, normalized to the submitted image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteAnnotation {
    pub landmarks: IndexMap<String, Point>,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RemoteResult {
    pub ok: bool,
    pub landmarks: IndexMap<String, Point>,
    pub confidence: f64,
    pub latency_ms: f64,
    pub captured_ns: u64,
}

#[async_trait]
pub trait RemoteDetector: Send + Sync {
    async fn annotate(&self, request: &RemoteRequest) -> Result<RemoteAnnotation, RemoteError>;
}

const LANDMARK_TYPES: [(&str, &str); 9] = [
    ("MOUTH_CENTER", "mouth_center"),
    ("MOUTH_LEFT", "mouth_left"),
    ("MOUTH_RIGHT", "mouth_right"),
    ("LEFT_CHEEK_CENTER", "cheek_left"),
    ("RIGHT_CHEEK_CENTER", "cheek_right"),
    ("LEFT_OF_LEFT_EYEBROW", "left_of_left_eyebrow"),
    ("RIGHT_OF_LEFT_EYEBROW", "right_of_left_eyebrow"),
    ("LEFT_OF_RIGHT_EYEBROW", "left_of_right_eyebrow"),
    ("RIGHT_OF_RIGHT_EYEBROW", "right_of_right_eyebrow"),
];

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: [AnnotateImageRequest<'a>; 1],
}

#[derive(Serialize)]
struct AnnotateImageRequest<'a> {
    image: ImageContent,
    features: [Feature<'a>; 1],
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    max_results: u32,
}

#[derive(Deserialize, Default)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    face_annotations: Vec<FaceAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FaceAnnotation {
    #[serde(default)]
    landmarks: Vec<FaceLandmark>,
    #[serde(default)]
    landmarking_confidence: f64,
    #[serde(default)]
    detection_confidence: f64,
}

#[derive(Deserialize)]
struct FaceLandmark {
    #[serde(rename = "type")]
    kind: String,
    position: Option<Position>,
}

#[derive(Deserialize)]
struct Position {
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
}

/// Parse an `images:annotate` response body into normalized landmarks.
pub fn parse_annotation(body: &str, width: u32, height: u32) -> Result<RemoteAnnotation, RemoteError> {
    let response: AnnotateResponse =
        serde_json::from_str(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
    let Some(first) = response.responses.into_iter().next() else {
        return Ok(RemoteAnnotation::default());
    };
    if let Some(status) = first.error {
        if !status.message.is_empty() {
            return Err(RemoteError::Api(status.message));
        }
    }
    let Some(face) = first.face_annotations.into_iter().next() else {
        return Ok(RemoteAnnotation::default());
    };

    let (w, h) = (f64::from(width.max(1)), f64::from(height.max(1)));
    let mut landmarks = IndexMap::new();
    for (kind, name) in LANDMARK_TYPES {
        let position = face
            .landmarks
            .iter()
            .find(|landmark| landmark.kind == kind)
            .and_then(|landmark| landmark.position.as_ref());
        if let Some(position) = position {
            landmarks.insert(name.to_string(), Point::new(position.x / w, position.y / h));
        }
    }
    let confidence = if face.landmarking_confidence == 0.0 {
        face.detection_confidence
    } else {
        (face.landmarking_confidence + face.detection_confidence) / 2.0
    };
    Ok(RemoteAnnotation {
        landmarks,
        confidence,
    })
}

/// Cloud Vision style face detection over HTTP.
pub struct HttpRemoteDetector {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpRemoteDetector {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl RemoteDetector for HttpRemoteDetector {
    async fn annotate(&self, request: &RemoteRequest) -> Result<RemoteAnnotation, RemoteError> {
        let body = AnnotateRequest {
            requests: [AnnotateImageRequest {
                image: ImageContent {
                    content: STANDARD.encode(&request.jpeg),
                },
                features: [Feature {
                    kind: "FACE_DETECTION",
                    max_results: 1,
                }],
            }],
        };
        let mut call = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            call = call.query(&[("key", key)]);
        }
        let response = call
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(RemoteError::Api(format!("HTTP {}: {}", status, text)));
        }
        parse_annotation(&text, request.width, request.height)
    }
}
