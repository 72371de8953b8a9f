//! Contact, medical profile and alert settings as supplied by the external profile store.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub id: String,
    pub name: String,
    pub phone: String,
    /// e.g. "Family", "Friend", "Doctor"
    pub relationship: String,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl EmergencyContact {
    pub fn new(name: &str, phone: &str, relationship: &str) -> Self {
        Self {
            id: format!("contact_{}", phone.trim()),
            name: name.to_string(),
            phone: phone.to_string(),
            relationship: relationship.to_string(),
            is_primary: false,
            is_active: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BloodType {
    APositive,
    ANegative,
    BPositive,
    BNegative,
    AbPositive,
    AbNegative,
    OPositive,
    ONegative,
    #[default]
    Unknown,
}

impl BloodType {
    pub fn display_name(&self) -> &'static str {
        match self {
            BloodType::APositive => "A+",
            BloodType::ANegative => "A-",
            BloodType::BPositive => "B+",
            BloodType::BNegative => "B-",
            BloodType::AbPositive => "AB+",
            BloodType::AbNegative => "AB-",
            BloodType::OPositive => "O+",
            BloodType::ONegative => "O-",
            BloodType::Unknown => "Unknown",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicalProfile {
    pub full_name: String,
    pub age: u32,
    pub blood_type: BloodType,
    pub allergies: Vec<String>,
    pub medications: Vec<String>,
    pub medical_conditions: Vec<String>,
    pub emergency_medical_info: String,
    pub doctor_name: String,
    pub doctor_phone: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub cancel_timeout_seconds: u32,
    pub send_sms: bool,
    pub make_call: bool,
    pub send_location: bool,
    pub include_medical_info: bool,
    pub alert_sound: bool,
    pub vibration: bool,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            cancel_timeout_seconds: 15,
            send_sms: true,
            make_call: false,
            send_location: true,
            include_medical_info: true,
            alert_sound: true,
            vibration: true,
        }
    }
}

/// Read-only view of the user's profile, taken once per alert.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSnapshot {
    pub contacts: Vec<EmergencyContact>,
    pub medical: Option<MedicalProfile>,
    pub settings: AlertSettings,
}

impl ProfileSnapshot {
    pub fn active_contacts(&self) -> Vec<EmergencyContact> {
        self.contacts.iter().filter(|c| c.is_active).cloned().collect()
    }
}

fn default_true() -> bool {
    true
}
