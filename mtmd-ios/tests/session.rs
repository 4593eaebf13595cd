//! Session lifecycle against the fixture engine

mod common;

use common::{
    collect, params, session, user_turn, write_png, FixtureEngine, IMAGE_POSITIONS,
};
use mtmd_ios::{EngineError, Role, Session, SessionError};

#[test]
fn missing_model_file_fails_without_panicking() {
    let dir = tempfile::tempdir().unwrap();
    let params = params()
        .with_model_path(dir.path().join("missing.gguf"))
        .with_mmproj_path(dir.path().join("mmproj.gguf"));

    let err = Session::new(&params).unwrap_err();
    assert!(matches!(
        err,
        SessionError::FileNotFound { kind: "Model", .. }
    ));
}

#[test]
fn missing_projector_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.gguf");
    std::fs::write(&model, b"GGUF").unwrap();
    let params = params()
        .with_model_path(&model)
        .with_mmproj_path(dir.path().join("missing.gguf"));

    let err = Session::new(&params).unwrap_err();
    assert!(matches!(
        err,
        SessionError::FileNotFound {
            kind: "Projector",
            ..
        }
    ));
}

#[cfg(not(feature = "llama"))]
#[test]
fn readable_files_without_a_backend_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.gguf");
    let mmproj = dir.path().join("mmproj.gguf");
    std::fs::write(&model, b"GGUF").unwrap();
    std::fs::write(&mmproj, b"GGUF").unwrap();

    let err = Session::new(&params().with_model_path(model).with_mmproj_path(mmproj)).unwrap_err();
    assert!(matches!(err, SessionError::BackendUnavailable));
}

#[test]
fn invalid_params_are_rejected_before_the_engine_is_used() {
    let engine = FixtureEngine::new(64);
    let probe = engine.probe();
    let err = Session::with_engine(&params().with_n_threads(0), Box::new(engine)).unwrap_err();
    assert!(matches!(err, SessionError::InvalidParams(_)));
    assert_eq!(probe.drops(), 1);
}

#[test]
fn warmup_runs_only_when_requested() {
    let engine = FixtureEngine::new(64);
    let probe = engine.probe();
    let _session = Session::with_engine(&params().with_warmup(true), Box::new(engine)).unwrap();
    assert_eq!(probe.warmups(), 1);

    let engine = FixtureEngine::new(64);
    let probe = engine.probe();
    let _session = Session::with_engine(&params(), Box::new(engine)).unwrap();
    assert_eq!(probe.warmups(), 0);
}

#[test]
fn generation_without_prefill_ends_immediately() {
    let mut session = session(FixtureEngine::new(64));
    let token = session.next_token().unwrap();
    assert!(token.is_end);
    assert!(token.text.is_empty());
    assert!(session.is_finished());
}

#[test]
fn hello_generation_terminates_within_the_limit() {
    let mut session = session(FixtureEngine::new(4096));
    session.prefill_text("hello", Role::User).unwrap();

    let mut generated = 0;
    let mut text = String::new();
    loop {
        let token = session.next_token().unwrap();
        text.push_str(&token.text);
        if token.is_end {
            break;
        }
        generated += 1;
        assert!(generated <= 100, "generation did not end");
    }
    assert_eq!(text, user_turn("hello"));
    assert!(session.next_token().unwrap().is_end);
}

#[test]
fn prediction_limit_caps_each_turn() {
    let engine = FixtureEngine::new(4096);
    let mut session =
        Session::with_engine(&params().with_n_predict(5), Box::new(engine)).unwrap();
    session.prefill_text("a long enough prompt", Role::User).unwrap();

    let indices: Vec<usize> = std::iter::from_fn(|| {
        let token = session.next_token().unwrap();
        (!token.is_end).then_some(token.index)
    })
    .collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);

    // a new prefill starts a new turn with a fresh budget
    session.prefill_text("again", Role::User).unwrap();
    assert_eq!(session.next_token().unwrap().index, 0);
}

#[test]
fn text_overflowing_the_context_fails_and_keeps_the_session() {
    let mut session = session(FixtureEngine::new(8));
    let err = session
        .prefill_text("this prompt is about twenty tokens", Role::User)
        .unwrap_err();
    assert!(matches!(err, SessionError::ContextFull { .. }));
    assert!(!err.to_string().is_empty());
    assert_eq!(session.n_past(), 0);
    assert!(session.next_token().unwrap().is_end);
}

#[test]
fn configured_window_applies_when_the_engine_window_is_larger() {
    let engine = FixtureEngine::new(256);
    let mut session = Session::with_engine(&params().with_n_ctx(8), Box::new(engine)).unwrap();
    assert_eq!(session.n_ctx(), 8);

    let err = session
        .prefill_text("this prompt is about twenty tokens", Role::User)
        .unwrap_err();
    assert!(matches!(err, SessionError::ContextFull { available: 8, .. }));
    assert_eq!(session.n_past(), 0);

    let dir = tempfile::tempdir().unwrap();
    let image = write_png(dir.path(), "gray.png", 8, 8, 10);
    let window = u32::try_from(IMAGE_POSITIONS + 2).unwrap();
    let engine = FixtureEngine::new(256);
    let mut session = Session::with_engine(&params().with_n_ctx(window), Box::new(engine)).unwrap();
    session.prefill_image(&image).unwrap();
    let err = session.prefill_image(&image).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Engine(EngineError::ContextFull { available: 2, .. })
    ));
    assert_eq!(session.n_past(), IMAGE_POSITIONS);
}

#[test]
fn generation_stops_with_an_error_when_the_context_fills_up() {
    let prompt = user_turn("hi");
    let mut session = session(FixtureEngine::new(prompt.len() + 1 + 2));
    session.prefill_text("hi", Role::User).unwrap();

    assert!(!session.next_token().unwrap().is_end);
    assert!(!session.next_token().unwrap().is_end);
    let err = session.next_token().unwrap_err();
    assert!(matches!(err, SessionError::ContextFull { needed: 1, available: 0 }));
    assert!(session.next_token().unwrap().is_end);
}

#[test]
fn non_image_file_fails_and_text_still_works() {
    let dir = tempfile::tempdir().unwrap();
    let bogus = dir.path().join("photo.png");
    std::fs::write(&bogus, "not an image").unwrap();

    let mut session = session(FixtureEngine::new(4096));
    assert!(matches!(
        session.prefill_image(&bogus),
        Err(SessionError::Media(_))
    ));
    assert_eq!(session.n_past(), 0);

    session.prefill_text("hello", Role::User).unwrap();
    assert_eq!(collect(&mut session), user_turn("hello"));
}

#[test]
fn images_append_their_positions() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_png(dir.path(), "gray.png", 8, 8, 128);

    let mut session = session(FixtureEngine::new(64));
    session.prefill_image(&image).unwrap();
    assert_eq!(session.n_past(), IMAGE_POSITIONS);
    session.prefill_image(&image).unwrap();
    assert_eq!(session.n_past(), 2 * IMAGE_POSITIONS);
}

#[test]
fn prefill_order_changes_the_answer() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_png(dir.path(), "a.png", 4, 4, 0);
    let b = write_png(dir.path(), "b.png", 4, 4, 128);
    let c = write_png(dir.path(), "c.png", 4, 4, 255);

    let first_piece = |order: [&std::path::Path; 3]| {
        let mut session = session(FixtureEngine::new(256));
        for path in order {
            session.prefill_image(path).unwrap();
        }
        session.prefill_text("describe", Role::User).unwrap();
        session.next_token().unwrap().text
    };

    let forward = first_piece([a.as_path(), b.as_path(), c.as_path()]);
    let backward = first_piece([c.as_path(), b.as_path(), a.as_path()]);
    assert_eq!(forward, "<img0>");
    assert_eq!(backward, "<img15>");
    assert_ne!(forward, backward);
}

#[test]
fn interleaved_prefill_order_changes_the_answer() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_png(dir.path(), "a.png", 4, 4, 0);
    let c = write_png(dir.path(), "c.png", 4, 4, 255);

    let answer = |first: &std::path::Path, last: &std::path::Path| {
        let mut session = session(FixtureEngine::new(256));
        session.prefill_image(first).unwrap();
        session.prefill_text("and then", Role::User).unwrap();
        session.prefill_image(last).unwrap();
        collect(&mut session)
    };

    let forward = answer(a.as_path(), c.as_path());
    let backward = answer(c.as_path(), a.as_path());
    assert_eq!(
        forward,
        format!(
            "{}{}{}",
            "<img0>".repeat(IMAGE_POSITIONS),
            user_turn("and then"),
            "<img15>".repeat(IMAGE_POSITIONS)
        )
    );
    assert!(backward.starts_with("<img15>"));
    assert_ne!(forward, backward);
}

#[test]
fn image_without_logits_ends_the_turn_quietly() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_png(dir.path(), "gray.png", 8, 8, 128);

    let mut session = session(FixtureEngine::new(256).without_image_logits());
    session.prefill_image(&image).unwrap();
    let token = session.next_token().unwrap();
    assert!(token.is_end);
    assert!(token.text.is_empty());
    assert_eq!(token.index, 0);
    assert!(session.is_finished());
    assert!(session.next_token().unwrap().is_end);

    // text after the image brings logits back
    session.prefill_text("describe", Role::User).unwrap();
    assert_eq!(
        collect(&mut session),
        format!("{}{}", "<img8>".repeat(IMAGE_POSITIONS), user_turn("describe"))
    );
}

#[test]
fn image_larger_than_the_remaining_context_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_png(dir.path(), "gray.png", 8, 8, 10);

    let mut session = session(FixtureEngine::new(IMAGE_POSITIONS + 2));
    session.prefill_image(&image).unwrap();
    let err = session.prefill_image(&image).unwrap_err();
    assert!(matches!(
        err,
        SessionError::Engine(EngineError::ContextFull { .. })
    ));
    assert_eq!(session.n_past(), IMAGE_POSITIONS);
}

#[test]
fn frames_are_prefilled_like_images() {
    let dir = tempfile::tempdir().unwrap();
    let frame = write_png(dir.path(), "frame.png", 1280, 720, 200);

    let mut session = session(FixtureEngine::new(64));
    session.prefill_frame(&frame).unwrap();
    assert_eq!(session.n_past(), IMAGE_POSITIONS);
}

#[test]
fn projector_without_vision_rejects_images() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_png(dir.path(), "gray.png", 4, 4, 10);

    let mut session = session(FixtureEngine::new(64).without_vision());
    assert!(matches!(
        session.prefill_image(&image),
        Err(SessionError::VisionUnsupported)
    ));
    assert!(matches!(
        session.prefill_frame(&image),
        Err(SessionError::VisionUnsupported)
    ));
}

#[test]
fn bos_is_added_only_to_an_empty_context() {
    let engine = FixtureEngine::new(256);
    let probe = engine.probe();
    let mut session = session(engine);

    session.prefill_text("be brief", Role::System).unwrap();
    session.prefill_text("hi", Role::User).unwrap();
    session.clear();
    session.prefill_text("hi", Role::User).unwrap();

    assert_eq!(probe.add_special(), vec![true, false, true]);
}

#[test]
fn empty_text_is_a_no_op() {
    let mut session = session(FixtureEngine::new(64).with_plain_chat());
    session.prefill_text("hi", Role::User).unwrap();
    let n_past = session.n_past();
    session.prefill_text("", Role::User).unwrap();
    assert_eq!(session.n_past(), n_past);
}

#[test]
fn multi_byte_characters_are_emitted_whole() {
    let mut session = session(FixtureEngine::new(256));
    session.prefill_text("héllo wörld", Role::User).unwrap();

    let mut pieces = Vec::new();
    loop {
        let token = session.next_token().unwrap();
        if token.is_end {
            break;
        }
        pieces.push(token.text);
    }
    // each two-byte character yields one empty piece
    assert_eq!(pieces.iter().filter(|p| p.is_empty()).count(), 2);
    assert!(pieces.contains(&"é".to_owned()));
    assert_eq!(pieces.concat(), user_turn("héllo wörld"));
}

#[test]
fn failed_prefill_rolls_back_the_cache() {
    let mut session = session(FixtureEngine::new(256).failing_on_eval(1));
    session.prefill_text("first", Role::System).unwrap();
    let n_past = session.n_past();

    let err = session.prefill_text("second", Role::User).unwrap_err();
    assert!(matches!(err, SessionError::Engine(EngineError::Decode(_))));
    assert_eq!(session.n_past(), n_past);
    assert!(session.next_token().unwrap().is_end);

    // the engine checks n_past against its cache, so this only works after a rollback
    session.prefill_text("second", Role::User).unwrap();
    assert!(!session.next_token().unwrap().is_end);
}

#[test]
fn failed_generation_step_is_reported_once() {
    let mut session = session(FixtureEngine::new(256).failing_on_eval(1));
    session.prefill_text("hi", Role::User).unwrap();
    let n_past = session.n_past();

    assert!(session.next_token().is_err());
    assert_eq!(session.n_past(), n_past);
    assert!(session.next_token().unwrap().is_end);
}

#[test]
fn iterator_reports_errors_and_stops() {
    let mut session = session(FixtureEngine::new(256).failing_on_eval(3));
    session.prefill_text("hi", Role::User).unwrap();

    let items: Vec<_> = session.tokens().collect();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0].as_deref().unwrap(), "<");
    assert_eq!(items[1].as_deref().unwrap(), "|");
    assert!(items[2].is_err());
}

#[test]
fn clear_starts_a_new_conversation() {
    let mut session = session(FixtureEngine::new(256));
    session.prefill_text("one", Role::User).unwrap();
    assert_eq!(collect(&mut session), user_turn("one"));

    session.clear();
    assert_eq!(session.n_past(), 0);
    assert!(session.next_token().unwrap().is_end);

    session.prefill_text("two", Role::User).unwrap();
    assert_eq!(collect(&mut session), user_turn("two"));
}

#[test]
fn later_turns_see_the_whole_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_png(dir.path(), "gray.png", 4, 4, 32);

    let engine = Box::new(FixtureEngine::new(512));
    let mut session = Session::with_engine(&params().with_n_predict(0), engine).unwrap();
    session.prefill_image(&image).unwrap();
    session.prefill_text("what is this?", Role::User).unwrap();
    let first = collect(&mut session);
    assert!(first.starts_with("<img2><img2><img2><img2><|user|>"));

    session.prefill_text("and now?", Role::User).unwrap();
    let second = collect(&mut session);
    assert!(second.starts_with(&first));
    assert!(second.ends_with(&user_turn("and now?")));
    assert!(session.n_past() > IMAGE_POSITIONS);
}

#[test]
fn sessions_are_isolated() {
    let first = FixtureEngine::new(256);
    let probe = first.probe();
    let mut first = session(first);
    let mut second = session(FixtureEngine::new(256));

    first.prefill_text("alpha", Role::User).unwrap();
    second.prefill_text("beta", Role::User).unwrap();
    drop(first);
    assert_eq!(probe.drops(), 1);

    assert_eq!(collect(&mut second), user_turn("beta"));

    let mut third = session(FixtureEngine::new(256));
    assert!(third.next_token().unwrap().is_end);
    third.prefill_text("gamma", Role::User).unwrap();
    assert_eq!(collect(&mut third), user_turn("gamma"));
}
