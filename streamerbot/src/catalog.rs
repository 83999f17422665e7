//! The set of subscribable events, as advertised by the server.

use crate::message::Response;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Built-in table used when the server's catalog can't be fetched.
const FALLBACK_EVENTS: &[(&str, &[&str])] = &[
    (
        "Application",
        &["ActionAdded", "ActionUpdated", "ActionDeleted"],
    ),
    (
        "Command",
        &["Message", "Whisper", "MessageCooldown", "BotWhisper"],
    ),
    ("Custom", &["Event"]),
    ("DonorDrive", &["Donation", "ProfileUpdated"]),
    ("FileWatcher", &["Changed", "Created", "Deleted", "Renamed"]),
    ("General", &["Custom"]),
    ("HypeRate", &["HeartRatePulse"]),
    (
        "Kofi",
        &[
            "Donation",
            "Subscription",
            "Resubscription",
            "ShopOrder",
            "Commission",
        ],
    ),
    ("Midi", &["Message"]),
    ("Misc", &["TimedAction", "PyramidSuccess", "PyramidBroken"]),
    ("Obs", &["Connected", "Disconnected"]),
    (
        "Patreon",
        &[
            "FollowCreated",
            "FollowDeleted",
            "PledgeCreated",
            "PledgeUpdated",
            "PledgeDeleted",
        ],
    ),
    ("Pulsoid", &["HeartRatePulse"]),
    ("Quote", &["Added", "Show"]),
    ("Raw", &["Action", "SubAction", "ActionCompleted"]),
    ("Shopify", &["OrderCreated", "OrderPaid"]),
    ("SpeechToText", &["Dictation", "Command"]),
    ("StreamElements", &["Tip", "Merch"]),
    ("Streamlabs", &["Donation", "Merchandise"]),
    ("TipeeeStream", &["Donation"]),
    ("TreatStream", &["Treat"]),
    (
        "Twitch",
        &[
            "Follow",
            "Cheer",
            "Sub",
            "ReSub",
            "GiftSub",
            "GiftBomb",
            "Raid",
            "HypeTrainStart",
            "HypeTrainUpdate",
            "HypeTrainLevelUp",
            "HypeTrainEnd",
            "RewardRedemption",
            "RewardCreated",
            "RewardUpdated",
            "RewardDeleted",
            "CommunityGoalContribution",
            "CommunityGoalEnded",
            "StreamUpdate",
            "Whisper",
            "FirstWord",
            "SubCounterRollover",
            "BroadcastUpdate",
            "StreamUpdateGameOnConnect",
            "PresentViewers",
            "PollCreated",
            "PollUpdated",
            "PollCompleted",
            "PredictionCreated",
            "PredictionUpdated",
            "PredictionCompleted",
            "PredictionCanceled",
            "PredictionLocked",
            "ChatMessage",
            "ChatMessageDeleted",
            "UserTimedOut",
            "UserBanned",
            "Announcement",
            "AdRun",
            "BotWhisper",
            "CharityDonation",
            "CharityCompleted",
            "CoinCheer",
            "ShoutoutCreated",
            "UserUntimedOut",
            "CharityStarted",
            "CharityProgress",
            "GoalBegin",
            "GoalProgress",
            "GoalEnd",
            "ShieldModeBegin",
            "ShieldModeEnd",
            "AdMidRoll",
        ],
    ),
    ("WebsocketClient", &["Open", "Close", "Message"]),
    ("WebsocketCustomServer", &["Open", "Close", "Message"]),
    (
        "YouTube",
        &[
            "BroadcastStarted",
            "BroadcastEnded",
            "Message",
            "MessageDeleted",
            "UserBanned",
            "SuperChat",
            "SuperSticker",
            "NewSponsor",
            "MemberMileStone",
            "NewSponsorOnlyStarted",
            "NewSponsorOnlyEnded",
            "StatisticsUpdated",
            "BroadcastUpdated",
            "MembershipGift",
            "GiftMembershipReceived",
            "FirstWords",
            "PresentViewers",
        ],
    ),
];

/// Mapping of every valid event source to its valid event types.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct EventCatalog(BTreeMap<String, BTreeSet<String>>);

impl EventCatalog {
    /// The built-in table, for when the live catalog is unavailable.
    pub fn fallback() -> Self {
        FALLBACK_EVENTS
            .iter()
            .map(|(source, types)| (*source, types.iter().copied()))
            .collect()
    }
    /// Reads the `events` field of a `GetEvents` response.
    pub fn from_response(response: &Response) -> Result<Self, serde_json::Error> {
        response.field("events")
    }
    pub fn contains_source(&self, source: &str) -> bool {
        self.0.contains_key(source)
    }
    pub fn contains(&self, source: &str, kind: &str) -> bool {
        self.types(source).is_some_and(|types| types.contains(kind))
    }
    pub fn types(&self, source: &str) -> Option<&BTreeSet<String>> {
        self.0.get(source)
    }
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.0
            .iter()
            .map(|(source, types)| (source.as_str(), types))
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<S, I, T> FromIterator<(S, I)> for EventCatalog
where
    S: Into<String>,
    I: IntoIterator<Item = T>,
    T: Into<String>,
{
    fn from_iter<It: IntoIterator<Item = (S, I)>>(iter: It) -> Self {
        let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (source, types) in iter {
            map.entry(source.into())
                .or_default()
                .extend(types.into_iter().map(Into::into));
        }
        EventCatalog(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fallback_has_no_duplicate_sources() {
        let catalog = EventCatalog::fallback();
        assert_eq!(catalog.len(), FALLBACK_EVENTS.len());
        assert!(catalog.contains("Twitch", "ChatMessage"));
        assert!(catalog.contains("Custom", "Event"));
        assert!(!catalog.contains("Twitch", "Nope"));
    }

    #[test]
    fn parses_get_events_response() {
        let response: Response = serde_json::from_value(json!({
            "id": "x",
            "status": "ok",
            "events": { "Twitch": ["Follow", "Cheer", "Follow"], "Kick": ["ChatMessage"] }
        }))
        .unwrap();
        let catalog = EventCatalog::from_response(&response).unwrap();
        assert_eq!(catalog.sources().collect::<Vec<_>>(), ["Kick", "Twitch"]);
        assert_eq!(catalog.types("Twitch").unwrap().len(), 2);
    }

    #[test]
    fn missing_events_field_is_an_error() {
        let response: Response =
            serde_json::from_value(json!({ "id": "x", "status": "ok" })).unwrap();
        assert!(EventCatalog::from_response(&response).is_err());
    }
}
