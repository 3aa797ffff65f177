pub const CLIENT_INFO: &str = concat!("socialchat-client/", env!("CARGO_PKG_VERSION"));

pub const HEADER_API_KEY: &str = "apikey";
pub const HEADER_AUTHORIZATION: &str = "Authorization";
pub const HEADER_PREFER: &str = "Prefer";
pub const HEADER_CLIENT_INFO: &str = "X-Client-Info";
pub const HEADER_TRACE_ID: &str = "X-Trace-Id";
pub const HEADER_REQUEST_ID: &str = "X-Request-Id";

pub const PREFER_RETURN_REPRESENTATION: &str = "return=representation";
pub const PREFER_RETURN_MINIMAL: &str = "return=minimal";

pub const REST_PATH: &str = "rest/v1";
pub const AUTH_PATH: &str = "auth/v1";
pub const STORAGE_PATH: &str = "storage/v1";
pub const REALTIME_PATH: &str = "realtime/v1/websocket";
pub const REALTIME_VSN: &str = "1.0.0";

pub const RPC_ADD_PHOTOS_TO_STORY: &str = "add_photos_to_story";

pub const BUCKET_POSTS: &str = "posts";
pub const BUCKET_STORIES: &str = "stories";
pub const BUCKET_AVATARS: &str = "avatars";

pub const LOGIN_ROUTE: &str = "/login";
