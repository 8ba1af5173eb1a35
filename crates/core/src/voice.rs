use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VoiceEmotion {
    #[default]
    Friendly,
    Serious,
    Cheerful,
    Calm,
    Soothing,
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSettings {
    pub emotion: VoiceEmotion,
    pub rate: f32,
}

const EXCITED: &[&str] = &["!", "wow", "amazing", "awesome", "love it", "so cool"];
const CONCERNED: &[&str] = &["worried", "concerned", "serious", "problem", "difficult"];
const CALMING: &[&str] = &["relax", "calm", "peaceful", "take it easy"];

/// Suggests a voice emotion and speaking rate for a reply.
pub fn detect_voice_settings(text: &str) -> VoiceSettings {
    let lower = text.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if any(EXCITED) {
        VoiceSettings {
            emotion: VoiceEmotion::Cheerful,
            rate: 1.1,
        }
    } else if any(CONCERNED) {
        VoiceSettings {
            emotion: VoiceEmotion::Serious,
            rate: 0.95,
        }
    } else if any(CALMING) {
        VoiceSettings {
            emotion: VoiceEmotion::Soothing,
            rate: 0.9,
        }
    } else if lower.contains('?') {
        VoiceSettings {
            emotion: VoiceEmotion::Friendly,
            rate: 1.05,
        }
    } else {
        VoiceSettings {
            emotion: VoiceEmotion::Friendly,
            rate: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_first_matching_mood() {
        assert_eq!(
            detect_voice_settings("Wow, that is great").emotion,
            VoiceEmotion::Cheerful
        );
        // Exclamation wins over concern words.
        assert_eq!(
            detect_voice_settings("That's a problem!").emotion,
            VoiceEmotion::Cheerful
        );
        assert_eq!(
            detect_voice_settings("I'm worried about work.").emotion,
            VoiceEmotion::Serious
        );
        assert_eq!(
            detect_voice_settings("Let's take it easy.").emotion,
            VoiceEmotion::Soothing
        );

        let question = detect_voice_settings("How was your day?");
        assert_eq!(question.emotion, VoiceEmotion::Friendly);
        assert_eq!(question.rate, 1.05);

        assert_eq!(detect_voice_settings("Okay.").rate, 1.0);
    }
}
