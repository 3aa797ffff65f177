use serde::Serialize;
use serde_json::json;
use shared_proto::auth::Session;
use shared_proto::models::Profile;
use uuid::Uuid;
use validator::Validate;

use super::query::{Filter, Query};
use super::{fetch_rows, insert_row, update_rows, AuthApi, Backend};
use crate::error::{AppError, AppResult};
use crate::protocol;
use crate::validation::{MediaKind, MediaUpload, ProfileForm, SignInForm, SignUpForm};

#[derive(Debug, Serialize)]
struct NewProfile<'a> {
    id: Uuid,
    name: &'a str,
    username: &'a str,
}

pub async fn fetch_profile(backend: &dyn Backend, user_id: Uuid) -> AppResult<Option<Profile>> {
    let rows = fetch_rows::<Profile>(backend, &Query::new().eq("id", user_id).limit(1)).await?;
    Ok(rows.into_iter().next())
}

/// Case-insensitive username prefix search, excluding the caller.
pub async fn search_profiles(
    backend: &dyn Backend,
    me: Uuid,
    prefix: &str,
    limit: u32,
) -> AppResult<Vec<Profile>> {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        return Ok(Vec::new());
    }
    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Err(AppError::validation("Invalid username search"));
    }

    let query = Query::new()
        .filter("username", Filter::ILike(format!("{}*", prefix)))
        .filter("id", Filter::Neq(me.to_string()))
        .order_by("username", true)
        .limit(limit);
    fetch_rows(backend, &query).await
}

/// Creates the account and, when a session is granted immediately, its
/// profile row.
pub async fn register(
    auth: &dyn AuthApi,
    backend: &dyn Backend,
    form: &SignUpForm,
) -> AppResult<Option<Profile>> {
    form.validate()?;

    let Some(session) = auth.sign_up(form.email.trim(), &form.password).await? else {
        return Ok(None);
    };

    let profile = insert_row::<Profile>(
        backend,
        serde_json::to_value(NewProfile {
            id: session.user_id(),
            name: form.name.trim(),
            username: form.username.trim(),
        })?,
    )
    .await?;

    tracing::info!(component = "profiles", user_id = %profile.id, "profile created");
    Ok(Some(profile))
}

pub async fn sign_in(auth: &dyn AuthApi, form: &SignInForm) -> AppResult<Session> {
    form.validate()?;
    auth.sign_in(form.email.trim(), &form.password).await
}

pub async fn update_profile(
    backend: &dyn Backend,
    me: Uuid,
    form: &ProfileForm,
) -> AppResult<Profile> {
    form.validate()?;

    let mut patch = serde_json::Map::new();
    if let Some(name) = &form.name {
        patch.insert("name".to_string(), json!(name.trim()));
    }
    if let Some(username) = &form.username {
        patch.insert("username".to_string(), json!(username.trim()));
    }
    if let Some(bio) = &form.bio {
        patch.insert("bio".to_string(), json!(bio.trim()));
    }
    if patch.is_empty() {
        return Err(AppError::validation("Nothing to update"));
    }

    update_rows::<Profile>(backend, &Query::new().eq("id", me), patch.into())
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::validation("Profile not found"))
}

pub async fn upload_avatar(
    backend: &dyn Backend,
    me: Uuid,
    media: &MediaUpload,
) -> AppResult<Profile> {
    if media.validate()? != MediaKind::Image {
        return Err(AppError::validation("Avatar must be an image"));
    }

    let path = format!("{}/{}.{}", me, Uuid::new_v4(), media.extension());
    let url = backend
        .upload(
            protocol::BUCKET_AVATARS,
            &path,
            media.bytes.clone(),
            &media.content_type,
        )
        .await?;

    update_rows::<Profile>(backend, &Query::new().eq("id", me), json!({ "avatar": url }))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::validation("Profile not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppErrorCode;
    use crate::testing::{FakeAuth, MemoryBackend};

    fn sign_up_form() -> SignUpForm {
        SignUpForm {
            email: "ana@example.com".to_string(),
            password: "secret-password".to_string(),
            name: " Ana ".to_string(),
            username: "ana_b".to_string(),
        }
    }

    #[tokio::test]
    async fn register_creates_profile_for_new_user() {
        let backend = MemoryBackend::new();
        let user = Uuid::new_v4();
        let auth = FakeAuth::new(user);

        let profile = register(&auth, &backend, &sign_up_form())
            .await
            .expect("register")
            .expect("profile");
        assert_eq!(profile.id, user);
        assert_eq!(profile.name, "Ana");
        assert_eq!(fetch_profile(&backend, user).await.expect("fetch"), Some(profile));
    }

    #[tokio::test]
    async fn invalid_sign_up_never_reaches_auth() {
        let backend = MemoryBackend::new();
        let auth = FakeAuth::new(Uuid::new_v4());
        let form = SignUpForm {
            username: "no spaces".to_string(),
            ..sign_up_form()
        };

        let err = register(&auth, &backend, &form).await.expect_err("invalid");
        assert_eq!(err.code, AppErrorCode::Validation);
        assert_eq!(backend.calls("insert", "profiles"), 0);
    }

    #[tokio::test]
    async fn sign_in_checks_form_then_credentials() {
        let auth = FakeAuth::new(Uuid::new_v4());
        let bad_email = SignInForm {
            email: "nope".to_string(),
            password: "x".to_string(),
        };
        assert_eq!(
            sign_in(&auth, &bad_email).await.expect_err("invalid").code,
            AppErrorCode::Validation
        );

        let form = SignInForm {
            email: "ana@example.com".to_string(),
            password: auth.password.clone(),
        };
        let session = sign_in(&auth, &form).await.expect("sign in");
        assert_eq!(session.user_id(), auth.user_id);
    }

    #[tokio::test]
    async fn profile_edits_and_avatar_update_the_row() {
        let backend = MemoryBackend::new();
        let me = Uuid::new_v4();
        backend.seed("profiles", json!({ "id": me, "name": "Ana", "username": "ana" }));

        let empty = update_profile(&backend, me, &ProfileForm::default()).await;
        assert!(empty.is_err());

        let form = ProfileForm {
            bio: Some(" hello ".to_string()),
            ..ProfileForm::default()
        };
        let updated = update_profile(&backend, me, &form).await.expect("update");
        assert_eq!(updated.bio.as_deref(), Some("hello"));

        let avatar = MediaUpload {
            file_name: "me.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            bytes: vec![1; 16],
        };
        let updated = upload_avatar(&backend, me, &avatar).await.expect("avatar");
        let url = updated.avatar.expect("avatar url");
        assert!(url.starts_with("memory://avatars/"));
        assert!(url.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn search_excludes_caller_and_rejects_odd_input() {
        let backend = MemoryBackend::new();
        let me = Uuid::new_v4();
        backend.seed("profiles", json!({ "id": me, "name": "Ana", "username": "ana" }));
        backend.seed("profiles", json!({ "id": Uuid::new_v4(), "name": "Anabel", "username": "Anabel" }));
        backend.seed("profiles", json!({ "id": Uuid::new_v4(), "name": "Bo", "username": "bo" }));

        let found = search_profiles(&backend, me, "an", 20).await.expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].username, "Anabel");
        assert!(search_profiles(&backend, me, "a%", 20).await.is_err());
        assert!(search_profiles(&backend, me, "  ", 20).await.expect("blank").is_empty());
    }
}
