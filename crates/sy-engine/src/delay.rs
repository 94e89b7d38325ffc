use std::time::Duration;

use async_trait::async_trait;
use sy_common::{Exchange, ExchangeFailure};

use crate::advice::{Advice, AdviceState};

/// Holds every exchange for a fixed time before the step runs
#[derive(Debug, Clone, Copy)]
pub struct DelayAdvice {
    delay: Duration,
}

impl DelayAdvice {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[async_trait]
impl Advice for DelayAdvice {
    fn name(&self) -> &str {
        "delay"
    }

    async fn before(&self, _exchange: &mut Exchange) -> Result<AdviceState, ExchangeFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delay_sleeps() {
        let advice = DelayAdvice::new(Duration::from_millis(30));
        let started = std::time::Instant::now();

        advice.before(&mut Exchange::with_body("x")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
