//! Binary encoding for messages that cross a process boundary.
//!
//! Messages are encoded as MessagePack maps with named fields, so the `type` discriminant is a
//! plain string key. Buffers are encoded as MessagePack binary strings.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// An error raised while encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The message could not be serialized.
    #[error("failed to encode message")]
    Encode(#[from] rmp_serde::encode::Error),
    /// The frame is not a valid message, for instance because of an unknown discriminant.
    #[error("failed to decode message")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes a message into a MessagePack frame.
pub fn encode<M>(message: &M) -> Result<Vec<u8>, CodecError>
where
    M: Serialize,
{
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decodes a message from a MessagePack frame.
pub fn decode<M>(frame: &[u8]) -> Result<M, CodecError>
where
    M: DeserializeOwned,
{
    Ok(rmp_serde::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{Buffer, ControllerMessage, TaskUid, Value, WorkerMessage, value_map};

    #[test]
    fn test_run_message() {
        let message = ControllerMessage::Run {
            uid: TaskUid::new(),
            method: "sum".to_owned(),
            args: vec![
                Value::from(1),
                Value::from(2.5),
                value_map! { "bytes" => Buffer::from(vec![1, 2, 3]), "none" => () },
            ],
        };

        let frame = encode(&message).unwrap();
        assert_eq!(decode::<ControllerMessage>(&frame).unwrap(), message);
    }

    #[test]
    fn test_terminate_flag_defaults_to_false() {
        let mut map = BTreeMap::new();
        map.insert("type", "terminate");
        let frame = rmp_serde::to_vec_named(&map).unwrap();

        assert_eq!(
            decode::<ControllerMessage>(&frame).unwrap(),
            ControllerMessage::Terminate {
                force_terminate_shared: false
            }
        );
    }

    #[test]
    fn test_discriminant_is_named() {
        let frame = encode(&WorkerMessage::Init {
            method_names: vec!["helloWorld".to_owned()],
        })
        .unwrap();

        let raw: Value = decode(&frame).unwrap();
        assert_eq!(raw.get("type").and_then(Value::as_str), Some("init"));
    }

    #[test]
    fn test_unknown_discriminant() {
        let mut map = BTreeMap::new();
        map.insert("type", "reboot");
        let frame = rmp_serde::to_vec_named(&map).unwrap();

        let error = decode::<ControllerMessage>(&frame).unwrap_err();
        assert!(matches!(error, CodecError::Decode(_)));
    }

    #[test]
    fn test_garbage_frame() {
        let error = decode::<WorkerMessage>(&[0xc1, 0x00]).unwrap_err();
        insta::assert_snapshot!(error, @"failed to decode message");
    }
}
