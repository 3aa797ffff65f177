//! Input checks that run before any network call.

use serde::Deserialize;
use validator::{Validate, ValidationError};

use crate::config::{MAX_IMAGE_BYTES, MAX_VIDEO_BYTES};
use crate::error::{AppError, AppResult};

pub const MAX_MESSAGE_LEN: usize = 4000;
pub const MAX_POST_LEN: usize = 5000;
pub const MAX_COMMENT_LEN: usize = 1000;

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
const VIDEO_TYPES: &[&str] = &["video/mp4", "video/webm", "video/quicktime"];

pub fn validate_username(value: &str) -> Result<(), ValidationError> {
    let trimmed = value.trim();
    if trimmed.len() < 3 || trimmed.len() > 32 {
        return Err(ValidationError::new("username_length"));
    }

    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(ValidationError::new("username_chars"));
    }

    Ok(())
}

pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SignUpForm {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 6, max = 72))]
    pub password: String,
    #[validate(length(min = 1, max = 64), custom(function = "validate_not_blank"))]
    pub name: String,
    #[validate(custom(function = "validate_username"))]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SignInForm {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct ProfileForm {
    #[validate(length(min = 1, max = 64), custom(function = "validate_not_blank"))]
    pub name: Option<String>,
    #[validate(custom(function = "validate_username"))]
    pub username: Option<String>,
    #[validate(length(max = 280))]
    pub bio: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CommentDraft {
    #[validate(length(min = 1, max = 1000), custom(function = "validate_not_blank"))]
    pub content: String,
}

pub fn validate_message_content(value: &str) -> AppResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("Message cannot be empty"));
    }
    if trimmed.chars().count() > MAX_MESSAGE_LEN {
        return Err(AppError::validation(format!(
            "Message is longer than {} characters",
            MAX_MESSAGE_LEN
        )));
    }
    Ok(())
}

/// A post needs text or media, and text has an upper bound.
pub fn validate_post_content(content: &str, has_media: bool) -> AppResult<()> {
    if content.trim().is_empty() && !has_media {
        return Err(AppError::validation("Post needs text or media"));
    }
    if content.chars().count() > MAX_POST_LEN {
        return Err(AppError::validation(format!(
            "Post is longer than {} characters",
            MAX_POST_LEN
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// A file picked for upload.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MediaUpload {
    pub fn validate(&self) -> AppResult<MediaKind> {
        let content_type = self.content_type.to_ascii_lowercase();

        let (kind, limit) = if IMAGE_TYPES.contains(&content_type.as_str()) {
            (MediaKind::Image, MAX_IMAGE_BYTES)
        } else if VIDEO_TYPES.contains(&content_type.as_str()) {
            (MediaKind::Video, MAX_VIDEO_BYTES)
        } else {
            return Err(AppError::validation(format!(
                "Unsupported file type: {}",
                self.content_type
            )));
        };

        if self.bytes.is_empty() {
            return Err(AppError::validation("File is empty"));
        }

        if self.bytes.len() > limit {
            return Err(AppError::validation(format!(
                "File is larger than {} MB",
                limit / (1024 * 1024)
            )));
        }

        Ok(kind)
    }

    /// Extension derived from the MIME type, not the user-supplied name.
    pub fn extension(&self) -> &'static str {
        match self.content_type.to_ascii_lowercase().as_str() {
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "video/mp4" => "mp4",
            "video/webm" => "webm",
            "video/quicktime" => "mov",
            _ => "bin",
        }
    }
}
