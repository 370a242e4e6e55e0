//! Biometric enrollment: reference face and ID card upload.

use std::sync::Arc;

use bytes::Bytes;

use super::bus::{MessageBus, Notice};
use crate::error::{ProctorError, Result};
use crate::face::{FaceMatchEngine, Frame};
use crate::model::{ImageSize, ReferenceDescriptor};
use crate::store::{BlobStore, RecordStore};

/// An uploaded image, decoded for detection and encoded for storage.
#[derive(Debug, Clone)]
pub struct EnrollmentImage {
    pub frame: Frame,
    pub encoded: Bytes,
    pub content_type: String,
}

impl EnrollmentImage {
    pub fn new(frame: Frame, encoded: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            frame,
            encoded: encoded.into(),
            content_type: content_type.into(),
        }
    }

    pub fn extension(&self) -> &str {
        extension_for(&self.content_type)
    }
}

fn extension_for(content_type: &str) -> &str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        other => other.rsplit('/').next().unwrap_or("bin"),
    }
}

pub struct Enrollment {
    engine: Arc<FaceMatchEngine>,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    bus: MessageBus,
}

impl Enrollment {
    pub fn new(
        engine: Arc<FaceMatchEngine>,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn RecordStore>,
        bus: MessageBus,
    ) -> Self {
        Self {
            engine,
            blobs,
            records,
            bus,
        }
    }

    /// Detect the face in `image` and store it as the participant's reference.
    ///
    /// Nothing is written when no face is found.
    pub async fn enroll_face(
        &self,
        participant_id: &str,
        image: &EnrollmentImage,
    ) -> Result<ReferenceDescriptor> {
        self.engine.setup().await?;

        let Some(face) = self.engine.detect_best_face(&image.frame).await? else {
            tracing::info!(participant_id = %participant_id, "No face in enrollment image");
            self.bus
                .publish(Notice::warning("No face detected in the image, please try again"));
            return Err(ProctorError::NoFaceFound);
        };

        let path = format!("faceImages/{}/face.{}", participant_id, image.extension());
        let url = self
            .blobs
            .upload(image.encoded.clone(), &path, &image.content_type)
            .await?;

        let reference = ReferenceDescriptor {
            descriptor: face.descriptor,
            image: ImageSize {
                width: image.frame.width,
                height: image.frame.height,
            },
        };
        self.records
            .update_descriptor(participant_id, reference.clone())
            .await?;

        tracing::info!(
            participant_id = %participant_id,
            url = %url,
            length = reference.descriptor.len(),
            "Enrolled reference face"
        );
        self.bus.publish(Notice::success("Face registered"));
        Ok(reference)
    }

    /// Store a picture of the participant's ID card and return its URL.
    pub async fn upload_id_card(
        &self,
        participant_id: &str,
        encoded: Bytes,
        content_type: &str,
    ) -> Result<String> {
        if encoded.is_empty() {
            return Err(ProctorError::Missing("ID card image"));
        }

        let path = format!("idImages/{}/id-card.{}", participant_id, extension_for(content_type));
        let url = self.blobs.upload(encoded, &path, content_type).await?;
        self.records.update_id_image(participant_id, &url).await?;

        tracing::info!(participant_id = %participant_id, url = %url, "Uploaded ID card");
        Ok(url)
    }
}
