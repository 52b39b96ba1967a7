use std::collections::HashSet;

use crate::error::{AllocationError, ValidationError};
use crate::limits::MAX_DIGIT_WIDTH;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Literal(String),
    /// Zero-padded decimal of fixed width.
    Digits { width: u32 },
    /// Unpadded decimal in `[from, to]`.
    Number { from: u64, to: u64 },
}

impl Component {
    fn cardinality(&self) -> u128 {
        match *self {
            Component::Literal(_) => 1,
            Component::Digits { width } => 10u128.pow(width),
            Component::Number { from, to } => u128::from(to - from) + 1,
        }
    }

    fn render(&self, index: u128, out: &mut String) {
        match self {
            Component::Literal(text) => out.push_str(text),
            Component::Digits { width } => {
                out.push_str(&format!("{index:0width$}", width = *width as usize));
            }
            Component::Number { from, .. } => {
                out.push_str(&(u128::from(*from) + index).to_string());
            }
        }
    }
}

/// A value template such as `95{digit:3}` or `room-{number:1:40}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    components: Vec<Component>,
}

impl Pattern {
    pub fn parse(source: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidPattern {
            pattern: source.to_string(),
            reason: reason.to_string(),
        };

        let mut components = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let close = rest[open..]
                .find('}')
                .ok_or_else(|| invalid("unterminated component"))?;
            let body = &rest[open + 1..open + close];
            rest = &rest[open + close + 1..];

            if !literal.is_empty() {
                components.push(Component::Literal(std::mem::take(&mut literal)));
            }
            let parts: Vec<&str> = body.split(':').collect();
            let component = match parts.as_slice() {
                ["digit", width] => {
                    let width: u32 = width.parse().map_err(|_| invalid("digit width is not a number"))?;
                    if !(1..=MAX_DIGIT_WIDTH).contains(&width) {
                        return Err(invalid("digit width must be between 1 and 10"));
                    }
                    Component::Digits { width }
                }
                ["number", from, to] => {
                    let from: u64 = from.parse().map_err(|_| invalid("number bound is not a number"))?;
                    let to: u64 = to.parse().map_err(|_| invalid("number bound is not a number"))?;
                    if from > to {
                        return Err(invalid("number range is inverted"));
                    }
                    Component::Number { from, to }
                }
                _ => return Err(invalid("unknown component")),
            };
            components.push(component);
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            components.push(Component::Literal(literal));
        }
        if components.is_empty() {
            return Err(invalid("empty pattern"));
        }

        Ok(Self {
            source: source.to_string(),
            components,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn cardinality(&self) -> u128 {
        self.components
            .iter()
            .fold(1u128, |acc, c| acc.saturating_mul(c.cardinality()))
    }

    /// The `index`-th candidate in ascending order. Last component varies fastest.
    fn candidate(&self, mut index: u128) -> String {
        let mut digits = vec![0u128; self.components.len()];
        for (slot, component) in digits.iter_mut().zip(&self.components).rev() {
            let base = component.cardinality();
            *slot = index % base;
            index /= base;
        }
        let mut out = String::new();
        for (component, digit) in self.components.iter().zip(digits) {
            component.render(digit, &mut out);
        }
        out
    }

    fn candidates(&self) -> impl Iterator<Item = String> + '_ {
        (0..self.cardinality()).map(move |i| self.candidate(i))
    }

    pub fn matches(&self, value: &str) -> bool {
        match_components(&self.components, value)
    }
}

fn match_components(components: &[Component], value: &str) -> bool {
    let Some((first, rest)) = components.split_first() else {
        return value.is_empty();
    };
    match first {
        Component::Literal(text) => value
            .strip_prefix(text.as_str())
            .is_some_and(|tail| match_components(rest, tail)),
        Component::Digits { width } => {
            let width = *width as usize;
            value.len() >= width
                && value.as_bytes()[..width].iter().all(u8::is_ascii_digit)
                && match_components(rest, &value[width..])
        }
        Component::Number { from, to } => {
            let max_len = to.to_string().len();
            let run = value.bytes().take_while(u8::is_ascii_digit).count();
            (1..=run.min(max_len)).any(|len| {
                let digits = &value[..len];
                let canonical = len == 1 || !digits.starts_with('0');
                canonical
                    && digits
                        .parse::<u64>()
                        .is_ok_and(|n| (*from..=*to).contains(&n))
                    && match_components(rest, &value[len..])
            })
        }
    }
}

/// Generates values for one value-space.
#[derive(Debug, Clone)]
pub struct ValueGenerator {
    patterns: Vec<Pattern>,
    allow_any_requested_value: bool,
}

impl ValueGenerator {
    pub fn new(patterns: &[String], allow_any_requested_value: bool) -> Result<Self, ValidationError> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            allow_any_requested_value,
        })
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn is_valid(&self, value: &str) -> bool {
        self.allow_any_requested_value || self.patterns.iter().any(|p| p.matches(value))
    }

    /// Lowest unused candidate of the first pattern that still has one.
    pub fn generate(&self, used: &HashSet<String>) -> Option<String> {
        // Each pattern hits a free candidate after at most `used.len() + 1` tries.
        self.patterns
            .iter()
            .find_map(|p| p.candidates().find(|candidate| !used.contains(candidate)))
    }

    pub fn generate_requested(&self, used: &HashSet<String>, requested: &str) -> Result<String, AllocationError> {
        if !self.is_valid(requested) {
            return Err(AllocationError::InvalidValue(requested.to_string()));
        }
        if used.contains(requested) {
            return Err(AllocationError::ValueAlreadyAllocated(requested.to_string()));
        }
        Ok(requested.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn used(values: &[&str]) -> HashSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn generator(patterns: &[&str]) -> ValueGenerator {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        ValueGenerator::new(&patterns, false).unwrap()
    }

    #[test]
    fn generated_value_avoids_used() {
        let g = generator(&["{number:100:199}"]);
        let value = g.generate(&used(&["100", "101"])).unwrap();
        assert_ne!(value, "100");
        assert_ne!(value, "101");
        assert_eq!(value, "102");
    }

    #[test]
    fn requested_used_value_is_rejected() {
        let g = generator(&["{number:100:199}"]);
        assert_eq!(
            g.generate_requested(&used(&["100", "101"]), "100"),
            Err(AllocationError::ValueAlreadyAllocated("100".into()))
        );
        assert_eq!(g.generate_requested(&used(&["100"]), "150"), Ok("150".into()));
    }

    #[test]
    fn requested_value_outside_patterns_is_invalid() {
        let g = generator(&["{number:100:199}"]);
        assert_eq!(
            g.generate_requested(&HashSet::new(), "200"),
            Err(AllocationError::InvalidValue("200".into()))
        );
        assert_eq!(
            g.generate_requested(&HashSet::new(), "0100"),
            Err(AllocationError::InvalidValue("0100".into()))
        );

        let any = ValueGenerator::new(&["{digit:2}".to_string()], true).unwrap();
        assert_eq!(any.generate_requested(&HashSet::new(), "conference"), Ok("conference".into()));
    }

    #[test]
    fn digits_are_zero_padded() {
        let g = generator(&["95{digit:3}"]);
        assert_eq!(g.generate(&HashSet::new()).as_deref(), Some("95000"));
        assert_eq!(g.generate(&used(&["95000", "95001"])).as_deref(), Some("95002"));
        assert!(g.is_valid("95123"));
        assert!(!g.is_valid("9512"));
        assert!(!g.is_valid("951234"));
    }

    #[test]
    fn exhausted_space_falls_through_patterns() {
        let g = generator(&["a{number:1:2}", "b{digit:1}"]);
        assert_eq!(g.generate(&used(&["a1", "a2"])).as_deref(), Some("b0"));

        let full: Vec<String> = (0..10).map(|d| format!("b{d}")).chain(["a1".into(), "a2".into()]).collect();
        assert_eq!(g.generate(&full.into_iter().collect()), None);
    }

    #[test]
    fn mixed_components_enumerate_in_order() {
        let p = Pattern::parse("r{number:1:2}-{digit:1}").unwrap();
        let first: Vec<String> = p.candidates().take(3).collect();
        assert_eq!(first, vec!["r1-0", "r1-1", "r1-2"]);
        assert_eq!(p.candidate(10), "r2-0");
        assert!(p.matches("r2-9"));
        assert!(!p.matches("r3-0"));
    }

    #[test]
    fn malformed_patterns() {
        for bad in ["{digit:0}", "{digit:11}", "{number:5:1}", "{hash}", "x{digit:2", ""] {
            assert!(Pattern::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        assert_eq!(Pattern::parse("sip:{digit:2}").unwrap().source(), "sip:{digit:2}");
    }
}
