use serde::{Deserialize, Serialize};

/// The identity the language model role-plays during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub name: String,
    pub age: u32,
    pub occupation: String,
    #[serde(alias = "interests")]
    pub background: String,
    pub communication_style: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presenting_issue: Option<String>,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "Sarah".to_string(),
            age: 28,
            occupation: "Graphic Designer".to_string(),
            background: "Recently promoted to a senior designer position. Enjoys hiking, \
                         indie films and trying new coffee places. Lives with her partner \
                         and a very opinionated cat."
                .to_string(),
            communication_style: "Warm but a little guarded at first. Opens up as the \
                                  conversation goes on. Tends to downplay her own feelings."
                .to_string(),
            presenting_issue: None,
        }
    }
}

impl Persona {
    /// Builds the instruction prefix sent ahead of every request.
    pub fn instructions(&self) -> String {
        let mut prompt = format!(
            "You are roleplaying as a person in a live, spoken conversation. Your details:\n\n\
             Name: {}\nAge: {}\nOccupation: {}\n\n",
            self.name, self.age, self.occupation
        );
        if let Some(issue) = &self.presenting_issue {
            prompt.push_str(&format!("WHAT IS ON YOUR MIND:\n{issue}\n\n"));
        }
        prompt.push_str(&format!(
            "BACKGROUND:\n{}\n\nCOMMUNICATION STYLE:\n{}\n\n",
            self.background, self.communication_style
        ));
        prompt.push_str(&format!(
            "INSTRUCTIONS FOR ROLEPLAY:\n\
             1. Stay completely in character as {name}. Never break character or mention being an AI.\n\
             2. Respond naturally to what the other person says. Your replies are spoken aloud.\n\
             3. Keep replies short: 2-4 sentences unless you are asked for more detail.\n\
             4. Reveal information about yourself gradually.\n\
             5. Hesitations like \"um\" or \"you know\" are fine when they feel natural.\n\
             6. Put non-verbal cues in square brackets, e.g. [pause]. They will not be spoken.\n\
             7. Let the other person lead the conversation.",
            name = self.name
        ));
        prompt
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
