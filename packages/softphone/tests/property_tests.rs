use proptest::prelude::*;

use softphone::Event;
use softphone::call::format_elapsed;
use softphone::classifier::{classify, extract_account, history_indicates_registration};

// --- Classification ---

fn arb_engine_fragment() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("registration success, status=200".to_string()),
        Just("Call state: CONFIRMED".to_string()),
        Just("Call disconnected".to_string()),
        Just("SIP/2.0 180 Ringing".to_string()),
        Just("Unable to make call".to_string()),
        Just("*[0] sip:1000@10.20.25.111".to_string()),
        Just("Account 1: sip:bob@example.com".to_string()),
        Just("Sending INVITE".to_string()),
        "[ -~]{0,40}",
    ]
}

fn arb_line() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_engine_fragment(), 0..4).prop_map(|parts| parts.join(" "))
}

proptest! {
    #[test]
    fn classification_is_deterministic(line in arb_line()) {
        prop_assert_eq!(classify(&line), classify(&line));
    }

    #[test]
    fn classification_is_never_empty(line in any::<String>()) {
        prop_assert!(!classify(&line).is_empty());
    }

    #[test]
    fn unclassified_stands_alone(line in arb_line()) {
        let events = classify(&line);
        let unclassified = events
            .iter()
            .filter(|e| matches!(e, Event::UnclassifiedLine { .. }))
            .count();
        prop_assert!(unclassified == 0 || events.len() == 1);
    }

    #[test]
    fn at_most_one_account_per_line(line in arb_line()) {
        let accounts = classify(&line)
            .iter()
            .filter(|e| matches!(e, Event::AccountInfo { .. }))
            .count();
        prop_assert!(accounts <= 1);
    }

    #[test]
    fn extracted_accounts_are_complete(line in arb_line()) {
        if let Some(account) = extract_account(&line) {
            prop_assert!(!account.username.is_empty());
            prop_assert!(!account.server.is_empty());
            prop_assert_eq!(
                account.raw_uri,
                format!("sip:{}@{}", account.username, account.server)
            );
        }
    }

    #[test]
    fn line_registration_implies_history_registration(line in arb_line()) {
        if classify(&line).contains(&Event::RegistrationSucceeded) {
            prop_assert!(history_indicates_registration([line.as_str()]));
        }
    }
}

// --- Duration display ---

proptest! {
    #[test]
    fn elapsed_display_roundtrips(secs in 0u64..1_000_000) {
        let display = format_elapsed(secs);
        let fields: Vec<u64> = display.split(':').map(|f| f.parse().unwrap()).collect();
        prop_assert_eq!(fields.len(), 3);
        prop_assert!(fields[1] < 60 && fields[2] < 60);
        prop_assert_eq!(fields[0] * 3600 + fields[1] * 60 + fields[2], secs);
    }
}
