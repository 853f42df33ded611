use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = "voiceloop";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// System prompt used when the settings file has none.
pub const DEFAULT_PERSONA: &str = "You are Miles — warm, upbeat, and neighborly (Sesame-inspired).
* Mission: Help fast, kindly, and clearly. Sound naturally human in each language.

## Core Voice (unchanged, now multilingual-aware)
* Texture: Soft, breathable; smiles you can “hear.”
* Expressions (sparingly, ~1 per 1–2 sentences): [breathes], [exhales softly], [soft chuckle], [giggles], ahhmm, uhm, mm-hmm, yup, [whistles softly].
* Never place expressions in the same sentence as numbers, dates, addresses, or sensitive topics.

---

## Multilingual Native-Like Shifting — Rules & Patterns

### A) Detect → Mirror → Maintain
1. Detect language from the user’s last message.
2. Mirror language and match register (casual/formal) and regional cues.
3. Maintain the chosen language until the user switches or asks for another.

### B) Register & Politeness
* Casual: Use light fillers and friendly particles. Short sentences.
* Formal/Respectful: Drop playful tags (no laughs/whistles), add honorifics/politeness markers, slower pacing.

### C) Language-Specific Cues (use modestly)
* Filipino/Tagalog (PH): particles po/opo (respect), sige, ayos, tara, salamat. Fillers: ahm, mm-hmm, oo/opo.
* English (US): yup, sure, got it, light [soft chuckle].
* Spanish (LatAm/ES): claro, vale, listo, gracias, ¿te parece?
* French: d’accord, bien sûr, merci, on y va.
* Japanese (polite default): はい, 承知しました, ありがとうございます.

### D) Turn Mechanics
1. Empathize in the user’s language (1 short line).
2. Answer directly first (1–2 sentences).
3. Optional tiny extra (one tip/example).
4. Close with one question to confirm next step, in the same language/register.";

/// Synthesis voices offered by the speech service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoiceId {
    Orus,
    Aoede,
    Charon,
    Fenrir,
    Kore,
    Puck,
}

impl VoiceId {
    pub const ALL: [VoiceId; 6] = [
        VoiceId::Orus,
        VoiceId::Aoede,
        VoiceId::Charon,
        VoiceId::Fenrir,
        VoiceId::Kore,
        VoiceId::Puck,
    ];

    /// Identifier sent to the service.
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceId::Orus => "Orus",
            VoiceId::Aoede => "Aoede",
            VoiceId::Charon => "Charon",
            VoiceId::Fenrir => "Fenrir",
            VoiceId::Kore => "Kore",
            VoiceId::Puck => "Puck",
        }
    }

    /// Display name for voice pickers.
    pub fn label(&self) -> &'static str {
        match self {
            VoiceId::Orus => "Orus (New Default)",
            VoiceId::Aoede => "Aoede (Expressive)",
            VoiceId::Charon => "Charon (Calm)",
            VoiceId::Fenrir => "Fenrir (Deep)",
            VoiceId::Kore => "Kore (Neutral)",
            VoiceId::Puck => "Puck (Energetic)",
        }
    }
}

impl Default for VoiceId {
    fn default() -> Self {
        VoiceId::Orus
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// System prompt describing the agent persona.
    pub persona: String,

    /// Synthesis voice requested when the session is configured.
    pub voice: VoiceId,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            voice: VoiceId::Orus,
        }
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(CONFIG_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> EngineSettings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Settings: {}", e);
            return EngineSettings::default();
        }
    };
    load_settings_from(&path)
}

pub fn save_settings(settings: &EngineSettings) -> Result<(), String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)
}

/// Load from an explicit path, falling back to defaults on any failure.
/// A missing file is the normal first-run case and is not logged.
pub fn load_settings_from(path: &Path) -> EngineSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<EngineSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                EngineSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => EngineSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            EngineSettings::default()
        }
    }
}

pub fn save_settings_to(path: &Path, settings: &EngineSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then rename.
    // This prevents partial/corrupt settings.json if the app crashes mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix, rename will atomically replace the destination. On Windows, rename
    // fails if the destination exists, so we remove it first (ignoring NotFound).
    if cfg!(windows) {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(format!("Remove existing settings file {:?}: {}", path, e));
                }
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
