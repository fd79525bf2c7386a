use crate::{
    api::{
        DetectionMode, RealtimeResponse, SaveCaptureRequest, SaveCaptureResponse,
        VideoProcessResponse, VideoRequest,
    },
    error::{CaptureError, Result},
    frame::to_data_url,
};
use async_trait::async_trait;
use reqwest::{multipart, Client, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// One frame to run through the realtime detector.
#[derive(Debug, Clone)]
pub struct RealtimeRequest {
    /// JPEG bytes, sent as a data URL.
    pub image_data: Vec<u8>,
    pub mode: DetectionMode,
    pub show_boxes: bool,
}

/// The detection service as seen by the capture loop.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn process_realtime(&self, request: RealtimeRequest) -> Result<RealtimeResponse>;

    async fn save_capture(&self, request: SaveCaptureRequest) -> Result<SaveCaptureResponse>;

    async fn process_video(&self, request: VideoRequest) -> Result<VideoProcessResponse>;
}

/// `InferenceBackend` over the service's form-post HTTP API.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    client: Client,
    origin: Url,
}

impl HttpBackend {
    pub fn new(origin: &str, timeout: Duration) -> anyhow::Result<Self> {
        let origin = Url::parse(origin)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, origin })
    }

    async fn post_form<T: DeserializeOwned>(&self, path: &str, form: multipart::Form) -> Result<T> {
        let url = self
            .origin
            .join(path)
            .map_err(|e| CaptureError::DispatchFailure(e.to_string()))?;
        let response = self.client.post(url).multipart(form).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!("{} answered {} with {} bytes", path, status, body.len());

        // The service puts its own failures in an `error` field, anything else
        // (a proxy page, an empty body) is a transport problem.
        if !status.is_success() {
            let error = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
                .map(CaptureError::EndpointError)
                .unwrap_or_else(|| CaptureError::DispatchFailure(format!("HTTP {status}")));
            return Err(error);
        }
        serde_json::from_slice(&body).map_err(|e| CaptureError::DispatchFailure(e.to_string()))
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn process_realtime(&self, request: RealtimeRequest) -> Result<RealtimeResponse> {
        let form = multipart::Form::new()
            .text("image_data", to_data_url(&request.image_data))
            .text("detection_type", request.mode.as_str())
            .text("show_boxes", request.show_boxes.to_string());
        let response: RealtimeResponse = self.post_form("process_realtime", form).await?;
        match response.error {
            Some(error) => Err(CaptureError::EndpointError(error)),
            None => Ok(response),
        }
    }

    async fn save_capture(&self, request: SaveCaptureRequest) -> Result<SaveCaptureResponse> {
        let mut form = multipart::Form::new()
            .text("image_data", to_data_url(&request.image_data))
            .text("detection_type", request.mode.as_str())
            .text("capture_id", request.capture_id.to_string());
        if let Some(detection_data) = request.detection_data {
            form = form.text("detection_data", detection_data);
        }
        let response: SaveCaptureResponse = self.post_form("save_capture", form).await?;
        match response.error {
            Some(error) => Err(CaptureError::EndpointError(error)),
            None => Ok(response),
        }
    }

    async fn process_video(&self, request: VideoRequest) -> Result<VideoProcessResponse> {
        let form = multipart::Form::new()
            .text("filepath", request.filepath)
            .text("detection_type", request.mode.as_str());
        let response: VideoProcessResponse = self.post_form("process_video", form).await?;
        match response.error {
            Some(error) => Err(CaptureError::EndpointError(error)),
            None => Ok(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_image_data;
    use axum::{
        extract::Multipart, http::StatusCode, response::Html, routing::post, Json, Router,
    };
    use serde_json::{json, Value};
    use std::{collections::HashMap, net::SocketAddr};

    async fn form_fields(mut multipart: Multipart) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            fields.insert(name, field.text().await.unwrap());
        }
        fields
    }

    async fn realtime(multipart: Multipart) -> Json<Value> {
        let fields = form_fields(multipart).await;
        let image = decode_image_data(&fields["image_data"]).unwrap();
        let processed_image = (fields["show_boxes"] == "true").then_some("AQID");
        match fields["detection_type"].as_str() {
            "license_plate" => Json(json!({
                "detections": [{"license_plate": format!("IMG{}", image.len()), "confidence": 0.8}],
                "processed_image": processed_image,
            })),
            _ => Json(json!({"intrusions": [], "vehicles": []})),
        }
    }

    async fn save(multipart: Multipart) -> Json<Value> {
        let fields = form_fields(multipart).await;
        let detection_id = if fields.contains_key("detection_data") { 7 } else { 8 };
        Json(json!({
            "image_path": format!("/static/captures/{}.jpg", fields["capture_id"]),
            "detection_id": detection_id,
        }))
    }

    async fn video(multipart: Multipart) -> (StatusCode, Json<Value>) {
        let fields = form_fields(multipart).await;
        if fields["filepath"] != "uploads/road.mp4" {
            return (StatusCode::NOT_FOUND, Json(json!({"error": "File not found"})));
        }
        (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "total_frames": 30,
                "processed_frames": 30,
                "detections_count": 1,
                "results": [
                    {"frame": 10, "frame_path": "uploads/result_frame_10.jpg", "progress": 33,
                     "intrusions": [{"vehicle_id": 3, "from_lane": 0, "to_lane": 1}]}
                ]
            })),
        )
    }

    async fn spawn_service() -> String {
        let app = Router::new()
            .route("/process_realtime", post(realtime))
            .route("/save_capture", post(save))
            .route("/process_video", post(video))
            .route(
                "/gateway/process_realtime",
                post(|| async { (StatusCode::BAD_GATEWAY, Html("<html>Bad Gateway</html>")) }),
            );
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn realtime_frame_round_trip() {
        let backend = HttpBackend::new(&spawn_service().await, Duration::from_secs(5)).unwrap();
        let response = backend
            .process_realtime(RealtimeRequest {
                image_data: vec![1, 2, 3, 4, 5],
                mode: DetectionMode::Plate,
                show_boxes: true,
            })
            .await
            .unwrap();
        let detections = response.detections.unwrap();
        assert_eq!(detections[0].plate(), Some("IMG5"));
        assert_eq!(response.processed_image.as_deref(), Some("AQID"));

        let response = backend
            .process_realtime(RealtimeRequest {
                image_data: vec![1],
                mode: DetectionMode::LaneIntrusion,
                show_boxes: false,
            })
            .await
            .unwrap();
        assert_eq!(response.intrusions.map(|i| i.len()), Some(0));
        assert!(response.detections.is_none());
    }

    #[tokio::test]
    async fn save_capture_sends_detection_data_when_present() {
        let backend = HttpBackend::new(&spawn_service().await, Duration::from_secs(5)).unwrap();
        let saved = backend
            .save_capture(SaveCaptureRequest {
                image_data: vec![1, 2],
                mode: DetectionMode::Plate,
                capture_id: 3,
                detection_data: Some("{}".into()),
            })
            .await
            .unwrap();
        assert_eq!(saved.image_path, "/static/captures/3.jpg");
        assert_eq!(saved.detection_id, "7");

        let saved = backend
            .save_capture(SaveCaptureRequest {
                image_data: vec![1, 2],
                mode: DetectionMode::Plate,
                capture_id: 4,
                detection_data: None,
            })
            .await
            .unwrap();
        assert_eq!(saved.detection_id, "8");
    }

    #[tokio::test]
    async fn video_errors_surface_as_endpoint_errors() {
        let backend = HttpBackend::new(&spawn_service().await, Duration::from_secs(5)).unwrap();
        let summary = backend
            .process_video(VideoRequest {
                filepath: "uploads/road.mp4".into(),
                mode: DetectionMode::LaneIntrusion,
            })
            .await
            .unwrap();
        assert_eq!(summary.detections_count, 1);
        assert_eq!(summary.results[0].intrusions.as_ref().unwrap()[0].to_lane, 1);

        let err = backend
            .process_video(VideoRequest {
                filepath: "uploads/missing.mp4".into(),
                mode: DetectionMode::LaneIntrusion,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::EndpointError(ref m) if m == "File not found"));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_dispatch_failure() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend =
            HttpBackend::new(&format!("http://{addr}/"), Duration::from_secs(2)).unwrap();
        let err = backend
            .process_realtime(RealtimeRequest {
                image_data: vec![1],
                mode: DetectionMode::Plate,
                show_boxes: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::DispatchFailure(_)));
    }

    #[tokio::test]
    async fn error_page_without_error_field_is_a_dispatch_failure() {
        let origin = format!("{}gateway/", spawn_service().await);
        let backend = HttpBackend::new(&origin, Duration::from_secs(5)).unwrap();
        let err = backend
            .process_realtime(RealtimeRequest {
                image_data: vec![1],
                mode: DetectionMode::Plate,
                show_boxes: false,
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, CaptureError::DispatchFailure(ref m) if m.starts_with("HTTP 502")),
            "{err:?}"
        );
    }
}
