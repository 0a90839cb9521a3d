mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{el, init_logger, ms, FakeDom};
use portal_chat::core::config::DetectionSettings;
use portal_chat::detector::{
    CompletionSignal, DetectorSettings, TurnCompletionDetector, TurnMarker, TurnPhase,
};
use portal_chat::locator::{ElementRole, SelectorSet};
use portal_chat::ChatError;
use regex::Regex;
use tokio::time::Instant;

const URL: &str = "https://chat.example.edu/page/site/newPc";

fn detection() -> DetectionSettings {
    DetectionSettings {
        poll_interval: ms(500),
        stable_polls: 6,
        use_marker: true,
        marker_template: "[DIALOG_{n}_END]".into(),
        marker_instruction: "(When your answer is complete, end it with {marker})".into(),
    }
}

fn detector(fallback: &[&str]) -> TurnCompletionDetector {
    TurnCompletionDetector::new(
        DetectorSettings::new(&detection(), Duration::from_secs(60)),
        SelectorSet::new(ElementRole::Response, &[".answer".to_string()]),
        fallback.iter().map(|s| s.to_string()).collect(),
        Regex::new(r"^(.*?)(\d+)$").unwrap(),
    )
}

async fn start_turn(
    d: &mut TurnCompletionDetector,
    dom: &FakeDom,
    turn: u32,
    message: &str,
) -> TurnMarker {
    let marker = TurnMarker::render(&detection(), turn);
    let baseline = d.capture_baseline(dom).await;
    dom.submit_now(&marker.augment(message));
    d.begin_turn(Some(marker.clone()), message, baseline);
    marker
}

#[tokio::test(start_paused = true)]
async fn hello_resolves_on_the_marker_poll() {
    init_logger();
    let dom = FakeDom::new(
        URL,
        vec![el("a")
            .matches(&[".answer"])
            .at(1, ms(0), "")
            .at(1, ms(500), "Hi the")
            .at(1, ms(1000), "Hi there! [DIALOG_1_END]")],
    );
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "hello").await;

    let r = d.wait_for_completion(&dom).await.unwrap();
    assert_eq!(r.text, "Hi there!");
    assert_eq!(r.signal, CompletionSignal::Marker);
    assert_eq!(r.elapsed, ms(1000));
    assert_eq!(d.phase(), TurnPhase::Resolved);
}

#[tokio::test(start_paused = true)]
async fn unchanged_text_resolves_after_six_polls() {
    let dom = FakeDom::new(URL, vec![el("a").matches(&[".answer"]).at(1, ms(0), "A")]);
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "q").await;

    let r = d.wait_for_completion(&dom).await.unwrap();
    assert_eq!(r.text, "A");
    assert_eq!(r.signal, CompletionSignal::Stable);
    // polls at 0.0 .. 2.5 s
    assert_eq!(r.elapsed, ms(2500));
}

#[tokio::test(start_paused = true)]
async fn earlier_signal_wins() {
    // marker first
    let dom = FakeDom::new(
        URL,
        vec![el("a")
            .matches(&[".answer"])
            .at(1, ms(0), "Done")
            .at(1, ms(1500), "Done [DIALOG_1_END]")],
    );
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "q").await;
    let r = d.wait_for_completion(&dom).await.unwrap();
    assert_eq!((r.signal, r.elapsed, r.text.as_str()), (CompletionSignal::Marker, ms(1500), "Done"));

    // stability first
    let dom = FakeDom::new(
        URL,
        vec![el("a")
            .matches(&[".answer"])
            .at(1, ms(0), "Done")
            .at(1, ms(5000), "Done [DIALOG_1_END]")],
    );
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "q").await;
    let r = d.wait_for_completion(&dom).await.unwrap();
    assert_eq!((r.signal, r.elapsed, r.text.as_str()), (CompletionSignal::Stable, ms(2500), "Done"));
}

#[tokio::test(start_paused = true)]
async fn growing_text_times_out_at_the_ceiling() {
    let mut answer = el("a").matches(&[".answer"]);
    let mut text = String::new();
    for step in 0..200u64 {
        text.push('x');
        answer = answer.at(1, ms(step * 500), &text);
    }
    let dom = FakeDom::new(URL, vec![answer]);
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "q").await;

    let started = Instant::now();
    let err = d.wait_for_completion(&dom).await.unwrap_err();
    let took = started.elapsed();
    assert!(matches!(err, ChatError::ResponseTimeout(t) if t == Duration::from_secs(60)));
    assert!(took >= Duration::from_secs(60) && took < Duration::from_secs(60) + ms(500));
    assert_eq!(d.phase(), TurnPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn second_turn_ignores_first_turn_leftovers() {
    let dom = FakeDom::new(
        URL,
        vec![
            el("old")
                .matches(&[".answer"])
                .at(1, ms(0), "First answer [DIALOG_1_END]"),
            el("new")
                .matches(&[".answer"])
                .at(2, ms(2000), "Second answer, longer than the first one"),
        ],
    );
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "one").await;
    assert_eq!(d.wait_for_completion(&dom).await.unwrap().text, "First answer");

    start_turn(&mut d, &dom, 2, "two").await;
    assert!(d.best().is_none());
    let r = d.wait_for_completion(&dom).await.unwrap();
    assert_eq!(r.text, "Second answer, longer than the first one");
    assert_eq!(r.element_fingerprint, "new");
}

#[tokio::test(start_paused = true)]
async fn own_prompt_bubble_is_not_taken_as_answer() {
    let dom = FakeDom::new(
        URL,
        vec![
            el("user").matches(&[".answer"]).echo(),
            el("bot").matches(&[".answer"]).at(1, ms(1000), "Sure. [DIALOG_1_END]"),
        ],
    );
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "hello").await;
    let r = d.wait_for_completion(&dom).await.unwrap();
    assert_eq!(r.text, "Sure.");
    assert_eq!(r.element_fingerprint, "bot");
}

#[tokio::test(start_paused = true)]
async fn degrades_to_fallback_selectors() {
    let dom = FakeDom::new(
        URL,
        vec![el("wide").matches(&["[class*='reply']"]).at(1, ms(500), "via fallback [DIALOG_1_END]")],
    );
    let mut d = detector(&["[class*='reply']"]);
    start_turn(&mut d, &dom, 1, "q").await;
    assert_eq!(d.wait_for_completion(&dom).await.unwrap().text, "via fallback");
}

#[tokio::test(start_paused = true)]
async fn degrades_to_text_bearing_scan() {
    let dom = FakeDom::new(
        URL,
        vec![el("scan").text_bearing().at(1, ms(500), "found by scan [DIALOG_1_END]")],
    );
    let mut d = detector(&["[class*='reply']"]);
    start_turn(&mut d, &dom, 1, "q").await;
    assert_eq!(d.wait_for_completion(&dom).await.unwrap().text, "found by scan");
}

#[tokio::test(start_paused = true)]
async fn degrades_to_iframes() {
    let dom = FakeDom::new(
        URL,
        vec![el("framed")
            .matches(&[".answer"])
            .in_frame()
            .at(1, ms(500), "inside a frame [DIALOG_1_END]")],
    );
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "q").await;
    assert_eq!(d.wait_for_completion(&dom).await.unwrap().text, "inside a frame");
}

#[tokio::test(start_paused = true)]
async fn nothing_anywhere_is_a_timeout() {
    let dom = FakeDom::new(URL, vec![]);
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "q").await;
    let err = d.wait_for_completion(&dom).await.unwrap_err();
    assert!(matches!(err, ChatError::ResponseTimeout(_)));
}

#[tokio::test(start_paused = true)]
async fn marker_without_text_is_no_response() {
    let dom = FakeDom::new(
        URL,
        vec![el("a").matches(&[".answer"]).at(1, ms(500), "[DIALOG_1_END]")],
    );
    let mut d = detector(&[]);
    start_turn(&mut d, &dom, 1, "q").await;
    assert!(matches!(
        d.wait_for_completion(&dom).await.unwrap_err(),
        ChatError::NoResponseFound
    ));
}

#[tokio::test(start_paused = true)]
async fn predicted_container_is_used_and_revalidated() {
    // Only reachable by id: matches no selector and is not text-bearing.
    let dom = FakeDom::new(
        URL,
        vec![
            el("stale").id("message-5").text("an old message"),
            el("next").id("message-6").at(1, ms(1000), "predicted [DIALOG_1_END]"),
        ],
    );
    let mut d = detector(&[]);
    d.set_container_hint(Some("message-4".into()));
    start_turn(&mut d, &dom, 1, "q").await;

    let r = d.wait_for_completion(&dom).await.unwrap();
    assert_eq!(r.text, "predicted");
    assert_eq!(d.container_hint(), Some("message-6"));
}

#[tokio::test(start_paused = true)]
async fn wrong_hint_falls_back_to_selectors() {
    let dom = FakeDom::new(
        URL,
        vec![
            el("unrelated").id("message-100").text("sidebar"),
            el("a").matches(&[".answer"]).at(1, ms(500), "real [DIALOG_1_END]"),
        ],
    );
    let mut d = detector(&[]);
    d.set_container_hint(Some("message-99".into()));
    start_turn(&mut d, &dom, 1, "q").await;
    assert_eq!(d.wait_for_completion(&dom).await.unwrap().text, "real");
}

#[tokio::test(start_paused = true)]
async fn baseline_collects_every_level() {
    let dom = FakeDom::new(
        URL,
        vec![
            el("p").matches(&[".answer"]).text("primary"),
            el("f").matches(&[".wide"]).text("fallback"),
            el("t").text_bearing().text("scan"),
            el("i").matches(&[".answer"]).in_frame().text("frame"),
            el("e").matches(&[".answer"]),
        ],
    );
    let d = detector(&[".wide"]);
    let baseline = d.capture_baseline(&dom).await;
    let expected: HashSet<String> = ["primary", "fallback", "scan", "frame"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(baseline, expected);
}

#[tokio::test(start_paused = true)]
async fn waiting_outside_a_turn_fails_immediately() {
    let dom = FakeDom::new(URL, vec![el("a").matches(&[".answer"]).at(1, ms(0), "old")]);
    let mut d = detector(&[]);

    let started = Instant::now();
    let err = d.wait_for_completion(&dom).await.unwrap_err();
    assert!(matches!(err, ChatError::Transient(_)));
    assert_eq!(started.elapsed(), Duration::ZERO);

    start_turn(&mut d, &dom, 1, "hello").await;
    assert_eq!(d.wait_for_completion(&dom).await.unwrap().text, "old");
    // the turn is over; a second wait must not poll past it
    let err = d.wait_for_completion(&dom).await.unwrap_err();
    assert!(matches!(err, ChatError::Transient(_)));
}
