//! Control events and widget-output frames exchanged over the fan-out

use serde::{Deserialize, Serialize};

/// Structured notifications for consumers that cache derived state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlEvent {
    /// A channel's filter chain or sampling rate changed
    #[serde(rename_all = "camelCase")]
    FilterChanged { channel_index: usize },
    /// A channel's circular buffer was cleared
    #[serde(rename_all = "camelCase")]
    BuffersReset { channel_index: usize },
    /// Device counter gaps detected since the previous report
    SamplesMissing { count: u64 },
    /// Pending queue overflowed and the oldest samples were dropped
    QueueOverflow { dropped: usize },
}

impl ControlEvent {
    /// Channel the event refers to, if it is channel-scoped
    pub fn channel_index(&self) -> Option<usize> {
        match self {
            ControlEvent::FilterChanged { channel_index }
            | ControlEvent::BuffersReset { channel_index } => Some(*channel_index),
            _ => None,
        }
    }
}

/// One frame on a named widget-output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WidgetFrame {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl WidgetFrame {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            WidgetFrame::Scalar(v) => Some(*v),
            WidgetFrame::Vector(_) => None,
        }
    }

    /// View the frame as a slice; a scalar is a one-element slice
    pub fn values(&self) -> &[f64] {
        match self {
            WidgetFrame::Scalar(v) => std::slice::from_ref(v),
            WidgetFrame::Vector(values) => values,
        }
    }
}

impl From<f64> for WidgetFrame {
    fn from(value: f64) -> Self {
        WidgetFrame::Scalar(value)
    }
}

impl From<Vec<f64>> for WidgetFrame {
    fn from(values: Vec<f64>) -> Self {
        WidgetFrame::Vector(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = ControlEvent::FilterChanged { channel_index: 3 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"type": "filterChanged", "channelIndex": 3}));
        assert_eq!(event.channel_index(), Some(3));
        assert_eq!(ControlEvent::SamplesMissing { count: 2 }.channel_index(), None);
    }

    #[test]
    fn test_frame_untagged() {
        let frames: Vec<WidgetFrame> = serde_json::from_str("[1.5, [1, 2, 3]]").unwrap();
        assert_eq!(frames[0], WidgetFrame::Scalar(1.5));
        assert_eq!(frames[1].values(), &[1.0, 2.0, 3.0]);
        assert_eq!(WidgetFrame::from(2.0).values(), &[2.0]);
    }
}
