//! Delivery-intent detection.
//!
//! A pure keyword scan over the user request, matching the verbs from
//! configuration. Simple substring matching rather than LLM-based
//! classification keeps detection deterministic and injection-resistant.
//! The result is computed once per request and threaded to both the
//! planner (as prompt guidance) and the validator (as an invariant).

use crate::config::DeliveryConfig;
use crate::types::DeliveryIntent;

/// Scan `request` for configured delivery verbs, case-insensitively.
///
/// Verbs are matched as substrings; the returned `detected_verbs` preserve
/// configuration order. No verbs are hard-coded here: an empty
/// `intent_verbs` list disables detection entirely.
pub fn detect_delivery_intent(request: &str, config: &DeliveryConfig) -> DeliveryIntent {
    let lower = request.to_lowercase();

    let detected_verbs: Vec<String> = config
        .intent_verbs
        .iter()
        .filter(|verb| !verb.is_empty() && lower.contains(&verb.to_lowercase()))
        .cloned()
        .collect();

    DeliveryIntent {
        has_intent: !detected_verbs.is_empty(),
        detected_verbs,
        required_tool: config.required_tool.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeliveryConfig {
        DeliveryConfig::default()
    }

    #[test]
    fn test_detects_single_verb() {
        let intent = detect_delivery_intent("search arsenal score and email it to me", &config());
        assert!(intent.has_intent);
        assert_eq!(intent.detected_verbs, vec!["email", "mail"]);
        assert_eq!(intent.required_tool, "compose_email");
    }

    #[test]
    fn test_no_verbs_no_intent() {
        let intent = detect_delivery_intent("what is the weather?", &config());
        assert!(!intent.has_intent);
        assert!(intent.detected_verbs.is_empty());
    }

    #[test]
    fn test_case_insensitive() {
        let intent = detect_delivery_intent("SEND the report please", &config());
        assert!(intent.has_intent);
        assert_eq!(intent.detected_verbs, vec!["send"]);
    }

    #[test]
    fn test_multiple_verbs_preserve_config_order() {
        let intent = detect_delivery_intent("attach the file and send it", &config());
        assert_eq!(intent.detected_verbs, vec!["send", "attach"]);
    }

    #[test]
    fn test_custom_verbs_and_tool() {
        let custom = DeliveryConfig {
            intent_verbs: vec!["forward".to_owned()],
            required_tool: "relay_message".to_owned(),
            ..DeliveryConfig::default()
        };
        let intent = detect_delivery_intent("forward this to bob", &custom);
        assert!(intent.has_intent);
        assert_eq!(intent.required_tool, "relay_message");
    }

    #[test]
    fn test_empty_verb_list_disables_detection() {
        let custom = DeliveryConfig {
            intent_verbs: vec![],
            ..DeliveryConfig::default()
        };
        let intent = detect_delivery_intent("email me everything", &custom);
        assert!(!intent.has_intent);
    }
}
