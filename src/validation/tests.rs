use super::*;
use crate::event::{Color, Drawing};

fn stroke(xs: &[f32], ys: &[f32], color: proto::drawing::Color) -> proto::Drawing {
    proto::Drawing {
        xs: xs.to_vec(),
        ys: ys.to_vec(),
        pressures: xs.to_vec(),
        widths: xs.to_vec(),
        color: color as i32,
    }
}

fn drawing_req(rooms: &[&str]) -> proto::SendEventReq {
    proto::SendEventReq {
        event: Some(proto::Event {
            event_drawing: Some(stroke(
                &[1.0, 2.0, 3.0],
                &[1.0, 2.0, 3.0],
                proto::drawing::Color::Black,
            )),
            ..Default::default()
        }),
        room_ids: rooms.iter().map(|r| r.to_string()).collect(),
    }
}

fn joined_req(rooms: &[&str]) -> proto::SendEventReq {
    proto::SendEventReq {
        event: Some(proto::Event {
            event_user_joined_the_room: true,
            ..Default::default()
        }),
        room_ids: rooms.iter().map(|r| r.to_string()).collect(),
    }
}

fn validate(req: &proto::SendEventReq) -> Result<Payload, WhiteboardError> {
    validate_outbound(req, "alice", StatusEventPolicy::Reject)
}

fn assert_bad_request(result: Result<Payload, WhiteboardError>, expected: &str) {
    match result {
        Err(WhiteboardError::BadRequest(msg)) => {
            assert!(msg.starts_with(expected), "{msg:?} should start with {expected:?}")
        }
        other => panic!("expected BadRequest({expected:?}), got {other:?}"),
    }
}

#[test]
fn test_valid_drawing_is_accepted() {
    let payload = validate(&drawing_req(&["a", "b"])).unwrap();
    match payload {
        Payload::Drawing(Drawing { color, xs, .. }) => {
            assert_eq!(color, Color::Black);
            assert_eq!(xs, vec![1.0, 2.0, 3.0]);
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[test]
fn test_missing_event_is_rejected() {
    let req = proto::SendEventReq {
        event: None,
        room_ids: vec!["a".to_string()],
    };
    assert_bad_request(validate(&req), errmsg::EVENT_MISSING);
}

#[test]
fn test_server_assigned_fields_are_rejected() {
    let mut req = drawing_req(&["a"]);
    req.event.as_mut().unwrap().created_at = 42;
    assert_bad_request(validate(&req), errmsg::CREATED_AT_SET);

    let mut req = drawing_req(&["a"]);
    req.event.as_mut().unwrap().by_user_id = "mallory".to_string();
    assert_bad_request(validate(&req), errmsg::BY_USER_ID_SET);

    let mut req = drawing_req(&["a"]);
    req.event.as_mut().unwrap().in_room_id = "a".to_string();
    assert_bad_request(validate(&req), errmsg::IN_ROOM_ID_SET);

    let mut req = drawing_req(&["a"]);
    req.event.as_mut().unwrap().event_users_in_the_room = Some(3);
    assert_bad_request(validate(&req), errmsg::USERS_IN_ROOM_SET);
}

#[test]
fn test_exactly_one_payload() {
    let empty = proto::SendEventReq {
        event: Some(proto::Event::default()),
        room_ids: vec!["a".to_string()],
    };
    assert_bad_request(validate(&empty), errmsg::NO_PAYLOAD);

    let mut two = drawing_req(&["a"]);
    two.event.as_mut().unwrap().event_user_left_the_room = true;
    assert_bad_request(
        validate_outbound(&two, "alice", StatusEventPolicy::Allow),
        errmsg::MANY_PAYLOADS,
    );

    let mut both_status = joined_req(&["a"]);
    both_status.event.as_mut().unwrap().event_user_left_the_room = true;
    assert_bad_request(
        validate_outbound(&both_status, "alice", StatusEventPolicy::Allow),
        errmsg::MANY_PAYLOADS,
    );
}

#[test]
fn test_status_events_follow_policy() {
    assert_bad_request(validate(&joined_req(&["a"])), errmsg::STATUS_EVENT);

    let payload = validate_outbound(&joined_req(&["a"]), "alice", StatusEventPolicy::Allow).unwrap();
    assert_eq!(payload, Payload::UserJoinedRoom);
}

#[test]
fn test_duplicate_rooms_are_rejected() {
    assert_bad_request(validate(&drawing_req(&["a", "a"])), errmsg::DUPLICATE_ROOM);
    assert!(validate(&drawing_req(&["a", "b"])).is_ok());
}

#[test]
fn test_no_rooms_is_rejected() {
    assert_bad_request(validate(&drawing_req(&[])), errmsg::NO_ROOMS);
}

#[test]
fn test_rooms_must_be_topic_safe() {
    for bad in ["", "a.b", "a*", "a>", "a/b", "a b", "a#"] {
        assert_bad_request(validate(&drawing_req(&["ok", bad])), errmsg::INVALID_ROOM);
    }
}

#[test]
fn test_caller_must_be_topic_safe() {
    let result = validate_outbound(&drawing_req(&["a"]), "al.ice", StatusEventPolicy::Reject);
    assert_bad_request(result, errmsg::INVALID_CALLER);
}

#[test]
fn test_drawing_shape_mismatch_is_rejected() {
    let mut req = drawing_req(&["a"]);
    req.event.as_mut().unwrap().event_drawing = Some(stroke(
        &[1.0, 2.0],
        &[1.0],
        proto::drawing::Color::Black,
    ));
    assert_bad_request(validate(&req), errmsg::DRAWING_SHAPE);

    req.event.as_mut().unwrap().event_drawing =
        Some(stroke(&[], &[], proto::drawing::Color::White));
    assert_bad_request(validate(&req), errmsg::DRAWING_SHAPE);
}

#[test]
fn test_invisible_or_unknown_color_is_rejected() {
    let mut req = drawing_req(&["a"]);
    req.event.as_mut().unwrap().event_drawing =
        Some(stroke(&[1.0], &[1.0], proto::drawing::Color::Invisible));
    assert_bad_request(validate(&req), errmsg::INVISIBLE_COLOR);

    let mut unknown = stroke(&[1.0], &[1.0], proto::drawing::Color::Black);
    unknown.color = 99;
    req.event.as_mut().unwrap().event_drawing = Some(unknown);
    assert_bad_request(validate(&req), errmsg::INVISIBLE_COLOR);
}

#[test]
fn test_rule_order_first_failure_wins() {
    // Server-assigned field and duplicate rooms: rule 1 reported
    let mut req = drawing_req(&["a", "a"]);
    req.event.as_mut().unwrap().created_at = 1;
    assert_bad_request(validate(&req), errmsg::CREATED_AT_SET);

    // Duplicate rooms and bad drawing: rule 3 reported
    let mut req = drawing_req(&["a", "a"]);
    req.event.as_mut().unwrap().event_drawing =
        Some(stroke(&[1.0], &[], proto::drawing::Color::Black));
    assert_bad_request(validate(&req), errmsg::DUPLICATE_ROOM);
}
