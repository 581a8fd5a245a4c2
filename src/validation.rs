//! Local input validation, applied before anything reaches the network.

use crate::error::ValidationError;
use crate::protocol::RoomSettings;

/// Shortest accepted display name (after trimming).
pub const MIN_DISPLAY_NAME_LEN: usize = 2;
/// Longest accepted display name (after trimming). A client-side product
/// limit, not a server rule.
pub const MAX_DISPLAY_NAME_LEN: usize = 20;
/// Room codes are at most this many characters.
pub const MAX_ROOM_CODE_LEN: usize = 6;

pub const QUESTION_COUNT_RANGE: (u32, u32) = (5, 20);
pub const TIME_LIMIT_RANGE: (u32, u32) = (5, 30);
pub const MAX_PLAYERS_RANGE: (u32, u32) = (2, 16);

/// Trim and check a display name, returning the trimmed form.
///
/// # Errors
///
/// [`ValidationError::EmptyDisplayName`] for blank input,
/// [`ValidationError::DisplayNameLength`] when out of bounds.
pub fn display_name(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyDisplayName);
    }
    let len = trimmed.chars().count();
    if !(MIN_DISPLAY_NAME_LEN..=MAX_DISPLAY_NAME_LEN).contains(&len) {
        return Err(ValidationError::DisplayNameLength {
            min: MIN_DISPLAY_NAME_LEN,
            max: MAX_DISPLAY_NAME_LEN,
        });
    }
    Ok(trimmed.to_string())
}

/// Normalize a room code (trim, upper-case) and check its shape.
///
/// # Errors
///
/// [`ValidationError::EmptyRoomCode`] for blank input,
/// [`ValidationError::InvalidRoomCode`] for anything longer than
/// [`MAX_ROOM_CODE_LEN`] or containing non-alphanumeric characters.
pub fn room_code(raw: &str) -> Result<String, ValidationError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(ValidationError::EmptyRoomCode);
    }
    if code.len() > MAX_ROOM_CODE_LEN || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidRoomCode {
            max: MAX_ROOM_CODE_LEN,
        });
    }
    Ok(code)
}

/// Check every field of a settings block against its allowed range.
///
/// # Errors
///
/// [`ValidationError::SettingOutOfRange`] naming the first offending field.
pub fn settings(settings: &RoomSettings) -> Result<(), ValidationError> {
    check_range("questionCount", settings.question_count, QUESTION_COUNT_RANGE)?;
    check_range(
        "perQuestionTimeLimit",
        settings.per_question_time_limit,
        TIME_LIMIT_RANGE,
    )?;
    check_range("maxPlayers", settings.max_players, MAX_PLAYERS_RANGE)
}

fn check_range(
    field: &'static str,
    value: u32,
    (min, max): (u32, u32),
) -> Result<(), ValidationError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::SettingOutOfRange {
            field,
            min,
            max,
            value,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn display_name_is_trimmed() {
        assert_eq!(display_name("  Ash ").unwrap(), "Ash");
    }

    #[test]
    fn display_name_rejects_blank_and_short() {
        assert_eq!(display_name("   "), Err(ValidationError::EmptyDisplayName));
        assert!(matches!(
            display_name("A"),
            Err(ValidationError::DisplayNameLength { .. })
        ));
        assert!(display_name(&"x".repeat(21)).is_err());
    }

    #[test]
    fn display_name_counts_characters_not_bytes() {
        assert_eq!(display_name("小智").unwrap(), "小智");
    }

    #[test]
    fn room_code_is_normalized() {
        assert_eq!(room_code(" ab12cd ").unwrap(), "AB12CD");
    }

    #[test]
    fn room_code_rejects_bad_shapes() {
        assert_eq!(room_code(""), Err(ValidationError::EmptyRoomCode));
        assert!(room_code("ABC1234").is_err());
        assert!(room_code("AB-12").is_err());
    }

    #[test]
    fn default_settings_are_valid() {
        assert!(settings(&RoomSettings::default()).is_ok());
    }

    #[test]
    fn settings_out_of_range_names_the_field() {
        let bad = RoomSettings {
            per_question_time_limit: 60,
            ..RoomSettings::default()
        };
        assert_eq!(
            settings(&bad),
            Err(ValidationError::SettingOutOfRange {
                field: "perQuestionTimeLimit",
                min: 5,
                max: 30,
                value: 60
            })
        );
    }
}
