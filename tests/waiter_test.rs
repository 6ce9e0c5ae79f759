mod common;

use std::time::Duration;

use agentic_autopilot::driver::Selector;
use agentic_autopilot::error::Error;
use agentic_autopilot::waiter::{AdaptiveWaiter, WaitCondition};

use common::{MockElement, MockPage};

#[tokio::test]
async fn waits_for_text_that_appears_later() {
    let page = MockPage::new();
    let waiter = AdaptiveWaiter::new();

    let background = page.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        *background.html.lock() = "<html><body>Welcome back</body></html>".to_string();
    });

    let condition = WaitCondition::text("Welcome back");
    let elapsed = waiter
        .wait_for(&page.as_driver(), &condition, Duration::from_secs(2))
        .await
        .unwrap();

    assert!(elapsed >= Duration::from_millis(50));
    // Learned timing is keyed by the page host plus the condition.
    let key = format!("example.test|{}", condition.signature());
    let pattern = waiter.store().predict(&key).unwrap();
    assert_eq!(pattern.observations, 1);
    assert!(waiter.store().predict(&condition.signature()).is_none());
}

#[tokio::test]
async fn learned_timing_does_not_leak_across_hosts() {
    let page = MockPage::new();
    *page.html.lock() = "<html><body>ready</body></html>".to_string();
    let waiter = AdaptiveWaiter::new();
    let condition = WaitCondition::text("ready");

    waiter
        .wait_for(&page.as_driver(), &condition, Duration::from_secs(1))
        .await
        .unwrap();

    *page.url.lock() = "https://other.test/landing".to_string();
    waiter
        .wait_for(&page.as_driver(), &condition, Duration::from_secs(1))
        .await
        .unwrap();

    let sig = condition.signature();
    let first = waiter.store().predict(&format!("example.test|{sig}")).unwrap();
    let second = waiter.store().predict(&format!("other.test|{sig}")).unwrap();
    assert_eq!(first.observations, 1);
    assert_eq!(second.observations, 1);
}

#[tokio::test]
async fn timeout_is_reported_and_recorded() {
    let page = MockPage::new();
    let waiter = AdaptiveWaiter::new();
    let condition = WaitCondition::text("never appears");

    let err = waiter
        .wait_for(&page.as_driver(), &condition, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WaitTimeout(_)));

    // The failed wait still feeds the pattern store, with low confidence.
    let key = format!("example.test|{}", condition.signature());
    let pattern = waiter.store().predict(&key).unwrap();
    assert_eq!(pattern.observations, 1);
    assert!(pattern.confidence < 0.3);
}

#[tokio::test]
async fn confident_pattern_still_meets_the_deadline() {
    let page = MockPage::new();
    let waiter = AdaptiveWaiter::new();
    let condition = WaitCondition::text("slow banner");

    // Several successful observations push confidence past the floor, so
    // the next wait polls on the predicted schedule.
    for _ in 0..4 {
        waiter
            .store()
            .record("example.test|text:slow banner", Duration::from_millis(400), true);
    }

    let background = page.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        *background.html.lock() = "<html><body>slow banner</body></html>".to_string();
    });

    let elapsed = waiter
        .wait_for(&page.as_driver(), &condition, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(elapsed < Duration::from_secs(1));
}

#[tokio::test]
async fn element_visibility_condition_sees_only_visible_matches() {
    let page = MockPage::with_elements(vec![MockElement::button("banner", "Banner").hidden()]);
    let waiter = AdaptiveWaiter::new();
    let condition = WaitCondition::element_visible(Selector::css("[data-testid*=\"banner\"]"));

    let err = waiter
        .wait_for(&page.as_driver(), &condition, Duration::from_millis(100))
        .await;
    assert!(err.is_err());

    // Making it visible satisfies the same condition.
    page.elements.lock()[0].visible = true;
    waiter
        .wait_for(&page.as_driver(), &condition, Duration::from_secs(1))
        .await
        .unwrap();
}

#[tokio::test]
async fn wait_for_any_returns_first_satisfied() {
    let page = MockPage::new();
    let waiter = AdaptiveWaiter::new();

    let conditions = vec![
        WaitCondition::text("never appears"),
        WaitCondition::url_contains("example.test"),
    ];
    let (index, _elapsed) = waiter
        .wait_for_any(&page.as_driver(), &conditions, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(index, 1);
}

#[tokio::test]
async fn wait_for_all_reports_every_outcome() {
    let page = MockPage::with_elements(vec![MockElement::button("ready", "Ready")]);
    let waiter = AdaptiveWaiter::new();

    let conditions = vec![
        WaitCondition::url_contains("example.test"),
        WaitCondition::element_visible(Selector::css("[data-testid*=\"ready\"]")),
        WaitCondition::NetworkIdle,
    ];
    let outcomes = waiter
        .wait_for_all(&page.as_driver(), &conditions, Duration::from_secs(2))
        .await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.is_ok()));
}

#[tokio::test]
async fn wait_for_all_tolerates_individual_failures() {
    let page = MockPage::new();
    let waiter = AdaptiveWaiter::new();

    let conditions = vec![
        WaitCondition::url_contains("example.test"),
        WaitCondition::text("never appears"),
        WaitCondition::NetworkIdle,
    ];
    let outcomes = waiter
        .wait_for_all(&page.as_driver(), &conditions, Duration::from_millis(100))
        .await;

    // One timeout doesn't abandon the others; every outcome comes back in
    // input order.
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].is_ok());
    assert!(matches!(outcomes[1], Err(Error::WaitTimeout(_))));
    assert!(outcomes[2].is_ok());
}

#[tokio::test]
async fn custom_predicate_condition() {
    let page = MockPage::new();
    let waiter = AdaptiveWaiter::new();

    let condition = WaitCondition::custom("two-navigations", |page| {
        Box::pin(async move {
            let url = page.url().await?;
            Ok(url.contains("example"))
        })
    });
    waiter
        .wait_for(&page.as_driver(), &condition, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(condition.signature(), "custom:two-navigations");
}
