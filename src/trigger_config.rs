use std::fmt;
use std::str::FromStr;

/// Hardware-independent limit on the number of sequential trigger stages.
pub const NUM_TRIGGER_STAGES: usize = 4;

/// Highest channel index a logic sample can carry (16-bit samples).
pub const MAX_TRIGGER_CHANNEL: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCondition {
    Zero,
    One,
    Rising,
    Falling,
    AnyEdge,
}

impl TriggerCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCondition::Zero => "0",
            TriggerCondition::One => "1",
            TriggerCondition::Rising => "r",
            TriggerCondition::Falling => "f",
            TriggerCondition::AnyEdge => "e",
        }
    }

    /// Edge conditions need the previous sample to be evaluated.
    pub fn is_edge(&self) -> bool {
        matches!(
            self,
            TriggerCondition::Rising | TriggerCondition::Falling | TriggerCondition::AnyEdge
        )
    }

    /// Evaluates the condition for one channel bit.
    ///
    /// `previous` is `None` for the very first sample of a session, in which
    /// case no edge can be detected yet.
    pub fn holds(&self, bit: bool, previous: Option<bool>) -> bool {
        match self {
            TriggerCondition::Zero => !bit,
            TriggerCondition::One => bit,
            TriggerCondition::Rising => previous.is_some_and(|prev| !prev && bit),
            TriggerCondition::Falling => previous.is_some_and(|prev| prev && !bit),
            TriggerCondition::AnyEdge => previous.is_some_and(|prev| prev != bit),
        }
    }
}

impl FromStr for TriggerCondition {
    type Err = TriggerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(TriggerCondition::Zero),
            "1" => Ok(TriggerCondition::One),
            "r" => Ok(TriggerCondition::Rising),
            "f" => Ok(TriggerCondition::Falling),
            "e" => Ok(TriggerCondition::AnyEdge),
            other => Err(TriggerParseError::UnknownCondition(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TriggerParseError {
    #[error("Unknown trigger condition '{0}' (expected one of 0, 1, r, f, e)")]
    UnknownCondition(String),

    #[error("Malformed trigger match '{0}' (expected <channel>=<condition>)")]
    MalformedMatch(String),

    #[error("Channel {0} is out of range")]
    ChannelOutOfRange(usize),

    #[error("Trigger stage {0} has no matches")]
    EmptyStage(usize),

    #[error("Too many trigger stages (max {NUM_TRIGGER_STAGES})")]
    TooManyStages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMatch {
    pub channel: usize,
    pub condition: TriggerCondition,
}

impl TriggerMatch {
    pub fn new(channel: usize, condition: TriggerCondition) -> Self {
        Self { channel, condition }
    }
}

/// A set of matches that must all hold on the same sample.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggerStage {
    matches: Vec<TriggerMatch>,
}

impl TriggerStage {
    pub fn matches(&self) -> &[TriggerMatch] {
        &self.matches
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    /// Bit mask of all channels this stage looks at.
    pub fn channel_mask(&self) -> u16 {
        self.matches
            .iter()
            .fold(0, |mask, m| mask | (1u16 << m.channel))
    }

    /// Checks the stage against `sample`; `previous` is the preceding sample,
    /// if there was one.
    pub fn is_satisfied(&self, sample: u16, previous: Option<u16>) -> bool {
        self.matches.iter().all(|m| {
            let bit = (sample >> m.channel) & 1 == 1;
            let prev_bit = previous.map(|p| (p >> m.channel) & 1 == 1);
            m.condition.holds(bit, prev_bit)
        })
    }
}

/// An ordered list of trigger stages. The trigger fires once every stage has
/// matched, each on the sample following the previous stage's match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSpec {
    stages: Vec<TriggerStage>,
}

impl TriggerSpec {
    pub fn new(stages: Vec<TriggerStage>) -> Result<Self, TriggerParseError> {
        if stages.len() > NUM_TRIGGER_STAGES {
            return Err(TriggerParseError::TooManyStages);
        }
        for (index, stage) in stages.iter().enumerate() {
            if stage.is_empty() {
                return Err(TriggerParseError::EmptyStage(index));
            }
            if let Some(m) = stage
                .matches
                .iter()
                .find(|m| m.channel > MAX_TRIGGER_CHANNEL)
            {
                return Err(TriggerParseError::ChannelOutOfRange(m.channel));
            }
        }
        if stages.is_empty() {
            return Err(TriggerParseError::EmptyStage(0));
        }
        Ok(Self { stages })
    }

    pub fn fire_when() -> StageBuilder {
        StageBuilder::new(Vec::new())
    }

    pub fn stages(&self) -> &[TriggerStage] {
        &self.stages
    }

    /// Bit mask of every channel referenced by any stage.
    pub fn channel_mask(&self) -> u16 {
        self.stages
            .iter()
            .fold(0, |mask, stage| mask | stage.channel_mask())
    }
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            for (j, m) in stage.matches.iter().enumerate() {
                if j > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}={}", m.channel, m.condition.as_str())?;
            }
        }
        Ok(())
    }
}

/// Parses the textual form `"<ch>=<cond>[,<ch>=<cond>...][;<next stage>...]"`,
/// e.g. `"0=r,3=1"` or `"2=1;2=0"`.
impl FromStr for TriggerSpec {
    type Err = TriggerParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut stages = Vec::new();
        for stage_text in s.split(';') {
            let mut matches = Vec::new();
            for match_text in stage_text.split(',').map(str::trim) {
                if match_text.is_empty() {
                    continue;
                }
                let (channel, condition) = match_text
                    .split_once('=')
                    .ok_or_else(|| TriggerParseError::MalformedMatch(match_text.to_string()))?;
                let channel: usize = channel
                    .trim()
                    .parse()
                    .map_err(|_| TriggerParseError::MalformedMatch(match_text.to_string()))?;
                matches.push(TriggerMatch::new(channel, condition.trim().parse()?));
            }
            stages.push(TriggerStage { matches });
        }
        Self::new(stages)
    }
}

#[derive(Debug)]
pub struct StageBuilder {
    done: Vec<TriggerStage>,
    current: Vec<TriggerMatch>,
}

impl StageBuilder {
    fn new(done: Vec<TriggerStage>) -> Self {
        Self {
            done,
            current: Vec::new(),
        }
    }

    pub fn channel(mut self, channel: usize, condition: TriggerCondition) -> Self {
        if let Some(existing) = self.current.iter_mut().find(|m| m.channel == channel) {
            existing.condition = condition;
        } else {
            self.current.push(TriggerMatch::new(channel, condition));
        }
        self
    }

    pub fn low(self, channel: usize) -> Self {
        self.channel(channel, TriggerCondition::Zero)
    }

    pub fn high(self, channel: usize) -> Self {
        self.channel(channel, TriggerCondition::One)
    }

    pub fn rising(self, channel: usize) -> Self {
        self.channel(channel, TriggerCondition::Rising)
    }

    pub fn falling(self, channel: usize) -> Self {
        self.channel(channel, TriggerCondition::Falling)
    }

    pub fn any_edge(self, channel: usize) -> Self {
        self.channel(channel, TriggerCondition::AnyEdge)
    }

    /// Closes the current stage; the following matches form the next one.
    pub fn then(mut self) -> Self {
        let matches = std::mem::take(&mut self.current);
        self.done.push(TriggerStage { matches });
        Self::new(self.done)
    }

    pub fn build(mut self) -> Result<TriggerSpec, TriggerParseError> {
        let matches = std::mem::take(&mut self.current);
        self.done.push(TriggerStage { matches });
        TriggerSpec::new(self.done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_single_stage() {
        let spec = TriggerSpec::fire_when().rising(0).high(3).build().unwrap();
        assert_eq!(spec.stages().len(), 1);
        assert_eq!(spec.channel_mask(), 0b1001);
        assert_eq!(spec.to_string(), "0=r,3=1");
    }

    #[test]
    fn test_builder_replaces_condition_for_same_channel() {
        let spec = TriggerSpec::fire_when().high(1).low(1).build().unwrap();
        assert_eq!(
            spec.stages()[0].matches(),
            &[TriggerMatch::new(1, TriggerCondition::Zero)]
        );
    }

    #[test]
    fn test_parse_multi_stage() {
        let spec: TriggerSpec = "2=1; 2=0,5=e".parse().unwrap();
        assert_eq!(spec.stages().len(), 2);
        assert_eq!(spec.stages()[1].matches().len(), 2);
        assert_eq!(spec.to_string(), "2=1;2=0,5=e");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "0=x".parse::<TriggerSpec>(),
            Err(TriggerParseError::UnknownCondition("x".to_string()))
        );
        assert_eq!(
            "abc".parse::<TriggerSpec>(),
            Err(TriggerParseError::MalformedMatch("abc".to_string()))
        );
        assert_eq!(
            "16=1".parse::<TriggerSpec>(),
            Err(TriggerParseError::ChannelOutOfRange(16))
        );
        assert_eq!(
            "0=1;".parse::<TriggerSpec>(),
            Err(TriggerParseError::EmptyStage(1))
        );
        assert_eq!(
            "0=1;0=1;0=1;0=1;0=1".parse::<TriggerSpec>(),
            Err(TriggerParseError::TooManyStages)
        );
    }

    #[test]
    fn test_edge_conditions_need_previous_sample() {
        assert!(!TriggerCondition::Rising.holds(true, None));
        assert!(TriggerCondition::Rising.holds(true, Some(false)));
        assert!(!TriggerCondition::Rising.holds(true, Some(true)));
        assert!(TriggerCondition::Falling.holds(false, Some(true)));
        assert!(TriggerCondition::AnyEdge.holds(false, Some(true)));
        assert!(!TriggerCondition::AnyEdge.holds(false, Some(false)));
        assert!(TriggerCondition::Zero.holds(false, None));
    }

    #[test]
    fn test_stage_satisfied_requires_all_matches() {
        let stage = TriggerSpec::fire_when()
            .rising(0)
            .high(1)
            .build()
            .unwrap()
            .stages()[0]
            .clone();
        assert!(stage.is_satisfied(0b11, Some(0b10)));
        assert!(!stage.is_satisfied(0b01, Some(0b00)));
        assert!(!stage.is_satisfied(0b11, Some(0b11)));
    }
}
