use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::IceCandidate;
use crate::transport::chunk::SdpPart;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Every message exchanged over the relay. Shapes are told apart by which
/// fields are present, so all fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RelayMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcaster: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub participant: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_participant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_part: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second_part: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub third_part: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(skip_serializing_if = "is_false")]
    pub left: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub close_entire_session: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub play_role_of_broadcaster: bool,
}

impl RelayMessage {
    fn from_user(user_token: &str) -> Self {
        Self {
            user_token: Some(user_token.to_string()),
            ..Self::default()
        }
    }

    pub fn room_announcement(user_token: &str, room_token: &str) -> Self {
        Self {
            room_token: Some(room_token.to_string()),
            broadcaster: Some(user_token.to_string()),
            ..Self::from_user(user_token)
        }
    }

    /// Asks `join_user` to open an offerer session, optionally on a named
    /// sub-channel instead of the sender's own token.
    pub fn join_request(user_token: &str, join_user: &str, channel: Option<&str>) -> Self {
        Self {
            participant: true,
            join_user: Some(join_user.to_string()),
            channel: channel.map(str::to_string),
            ..Self::from_user(user_token)
        }
    }

    pub fn new_participant(user_token: &str, participant: &str) -> Self {
        Self {
            new_participant: Some(participant.to_string()),
            ..Self::from_user(user_token)
        }
    }

    pub fn sdp_part(user_token: &str, part: SdpPart, text: String) -> Self {
        let mut message = Self::from_user(user_token);
        match part {
            SdpPart::First => message.first_part = Some(text),
            SdpPart::Second => message.second_part = Some(text),
            SdpPart::Third => message.third_part = Some(text),
        }
        message
    }

    pub fn candidate(user_token: &str, candidate: IceCandidate) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::from_user(user_token)
        }
    }

    pub fn left(user_token: &str, close_entire_session: bool) -> Self {
        Self {
            left: true,
            close_entire_session,
            ..Self::from_user(user_token)
        }
    }

    pub fn play_role_of_broadcaster(user_token: &str, room_token: &str) -> Self {
        Self {
            play_role_of_broadcaster: true,
            room_token: Some(room_token.to_string()),
            ..Self::from_user(user_token)
        }
    }

    pub fn is_from(&self, user_token: &str) -> bool {
        self.user_token.as_deref() == Some(user_token)
    }

    pub fn sdp_parts(&self) -> impl Iterator<Item = (SdpPart, &str)> {
        [
            (SdpPart::First, self.first_part.as_deref()),
            (SdpPart::Second, self.second_part.as_deref()),
            (SdpPart::Third, self.third_part.as_deref()),
        ]
        .into_iter()
        .filter_map(|(part, text)| text.map(|text| (part, text)))
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
