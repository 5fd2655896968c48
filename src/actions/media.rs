/// Sound playback and text-to-speech.
use super::{ActionInstance, Failure, Param};
use crate::scope::Scope;

// percent, clamped to 0..=100
fn volume(p: &Param, scope: &Scope) -> Result<u8, Failure> {
    let v = p.number(scope)?;
    Ok(if v.is_nan() { 100 } else { v.clamp(0.0, 100.0) as u8 })
}

#[derive(Debug, Clone)]
pub struct PlaySound {
    pub resource: Param,
    pub volume:   Param,
}

impl PlaySound {
    pub fn new(resource: Param) -> Self {
        Self { resource, volume: Param::literal("100") }
    }

    pub fn volume(mut self, volume: Param) -> Self {
        self.volume = volume;
        self
    }

    pub fn describe(&self, scope: Option<&Scope>) -> String {
        format!(
            "play sound ({}) at volume ({})",
            self.resource.describe(scope),
            self.volume.describe(scope)
        )
    }

    pub async fn execute(&self, inst: &mut ActionInstance) -> Result<(), Failure> {
        let resource = self.resource.text(&inst.scope)?;
        let volume = volume(&self.volume, &inst.scope)?;
        inst.effects.play_sound(&resource, volume).await.map_err(Failure::delegate)
    }
}

#[derive(Debug, Clone)]
pub struct Speak {
    pub text:   Param,
    pub volume: Param,
    /// -10 (slowest) to 10 (fastest).
    pub rate:   Param,
}

impl Speak {
    pub fn new(text: Param) -> Self {
        Self { text, volume: Param::literal("100"), rate: Param::literal("0") }
    }

    pub fn volume(mut self, volume: Param) -> Self {
        self.volume = volume;
        self
    }

    pub fn rate(mut self, rate: Param) -> Self {
        self.rate = rate;
        self
    }

    pub fn describe(&self, scope: Option<&Scope>) -> String {
        format!(
            "say ({}) at volume ({}) and rate ({})",
            self.text.describe(scope),
            self.volume.describe(scope),
            self.rate.describe(scope)
        )
    }

    pub async fn execute(&self, inst: &mut ActionInstance) -> Result<(), Failure> {
        let text = self.text.text(&inst.scope)?;
        let volume = volume(&self.volume, &inst.scope)?;
        let rate = self.rate.number(&inst.scope)?;
        let rate = if rate.is_nan() { 0 } else { rate.clamp(-10.0, 10.0) as i8 };
        inst.effects.speak(&text, volume, rate).await.map_err(Failure::delegate)
    }
}
