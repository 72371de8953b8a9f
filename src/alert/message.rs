use crate::types::{AlertSettings, BloodType, EmergencyAlert};

/// Single-segment SMS length
pub const SMS_SEGMENT_LEN: usize = 160;

/// Text sent to every contact once an alert is confirmed.
pub fn build_emergency_message(alert: &EmergencyAlert, settings: &AlertSettings) -> String {
    let event = &alert.accident_event;
    let mut msg = String::new();
    msg.push_str("EMERGENCY ALERT\n\n");
    msg.push_str("A possible vehicle accident has been detected.\n");
    msg.push_str(&format!("Type: {}\n", event.kind.display_text()));
    msg.push_str(&format!(
        "Time: {} UTC\n",
        event.timestamp.format("%d/%m/%Y %H:%M:%S")
    ));

    if settings.send_location {
        if let Some(location) = alert.location.as_ref().or(event.location.as_ref()) {
            msg.push_str("\nLocation:\n");
            msg.push_str(&location.format());
            msg.push_str(&format!("\nMap: {}\n", location.maps_link()));
        }
    }

    if settings.include_medical_info {
        if let Some(medical) = alert
            .medical_info
            .as_ref()
            .filter(|m| !m.full_name.is_empty())
        {
            msg.push_str("\nMedical information:\n");
            msg.push_str(&format!("Name: {}\n", medical.full_name));
            if medical.blood_type != BloodType::Unknown {
                msg.push_str(&format!("Blood type: {}\n", medical.blood_type.display_name()));
            }
            if !medical.allergies.is_empty() {
                msg.push_str(&format!("Allergies: {}\n", medical.allergies.join(", ")));
            }
            if !medical.medical_conditions.is_empty() {
                msg.push_str(&format!(
                    "Conditions: {}\n",
                    medical.medical_conditions.join(", ")
                ));
            }
            if !medical.emergency_medical_info.is_empty() {
                msg.push_str(&format!(
                    "Additional info: {}\n",
                    medical.emergency_medical_info
                ));
            }
        }
    }

    msg.push_str("\nThis is an automated alert.");
    msg
}

/// Split into segments of at most [`SMS_SEGMENT_LEN`] characters.
/// Splits on char boundaries so multi-byte text is never cut mid-character.
pub fn split_message(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(SMS_SEGMENT_LEN)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
