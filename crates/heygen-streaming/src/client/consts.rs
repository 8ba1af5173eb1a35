pub const HEYGEN_API_KEY: &str = "HEYGEN_API_KEY";

pub const BASE_URL: &str = "https://api.heygen.com/v1";

pub const API_KEY_HEADER: &str = "x-api-key";

pub const CREATE_TOKEN_PATH: &str = "streaming.create_token";
pub const NEW_SESSION_PATH: &str = "streaming.new";
pub const START_SESSION_PATH: &str = "streaming.start";
pub const TASK_PATH: &str = "streaming.task";
pub const INTERRUPT_PATH: &str = "streaming.interrupt";
pub const STOP_SESSION_PATH: &str = "streaming.stop";

pub const EVENT_CHANNEL_CAPACITY: usize = 64;
