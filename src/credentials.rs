use anyhow::Result;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{info, warn};
use parley::config::get_config_dir;
use parley::models::Session;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::PathBuf;

/// Session cached between runs. The token is stored base64-encoded.
#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub base_url: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl SavedSession {
    pub fn from_session(session: &Session) -> Self {
        SavedSession {
            base_url: session.base_url.clone(),
            user_id: session.user_id.clone(),
            token: Some(BASE64.encode(&session.token)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        let encoded = self.token.as_ref()?;
        let bytes = BASE64.decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }

    pub fn into_session(self) -> Option<Session> {
        let token = self.get_token()?;
        Some(Session::new(&self.user_id, &token, &self.base_url))
    }
}

fn get_session_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("session.json"))
}

pub fn save_session(session: &Session) -> Result<()> {
    let path = get_session_path()?;
    let file = File::create(&path)?;
    serde_json::to_writer_pretty(file, &SavedSession::from_session(session))?;

    info!("Session saved for {}", session.user_id);
    Ok(())
}

pub fn load_session() -> Result<Option<SavedSession>> {
    let path = get_session_path()?;
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(&path)?;
    match serde_json::from_str::<SavedSession>(&contents) {
        Ok(saved) => {
            info!("Loaded session for {} from {}", saved.user_id, path.display());
            Ok(Some(saved))
        }
        Err(e) => {
            warn!("Ignoring unreadable session file {}: {}", path.display(), e);
            Ok(None)
        }
    }
}
