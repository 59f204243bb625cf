use std::rc::Rc;

use crate::error::StreamError;

pub use byte_length::ByteLengthQueuingStrategy;
pub use count::CountQueuingStrategy;

mod byte_length;
mod count;

/// QueuingStrategy describes how backpressure should be signalled: a high
/// water mark plus an optional per-chunk size function.
/// https://streams.spec.whatwg.org/#qs-api
pub struct QueuingStrategy<T> {
    high_water_mark: Option<f64>,
    size: Option<SizeFunction<T>>,
}

type SizeFunction<T> = Rc<dyn Fn(&T) -> f64>;

impl<T> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            size: None,
        }
    }
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: self.size.clone(),
        }
    }
}

impl<T> QueuingStrategy<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_water_mark(high_water_mark: f64) -> Self {
        Self {
            high_water_mark: Some(high_water_mark),
            size: None,
        }
    }

    pub fn size(mut self, size: impl Fn(&T) -> f64 + 'static) -> Self {
        self.size = Some(Rc::new(size));
        self
    }

    pub(crate) fn has_size_function(&self) -> bool {
        self.size.is_some()
    }

    // https://streams.spec.whatwg.org/#validate-and-normalize-high-water-mark
    pub(crate) fn extract_high_water_mark(
        this: Option<&Self>,
        default_hwm: f64,
    ) -> Result<f64, StreamError> {
        match this.and_then(|strategy| strategy.high_water_mark) {
            // If strategy["highWaterMark"] does not exist, return defaultHWM.
            None => Ok(default_hwm),
            Some(high_water_mark) => {
                // If highWaterMark is NaN or highWaterMark < 0, throw a RangeError exception.
                if high_water_mark.is_nan() || high_water_mark < 0.0 {
                    Err(StreamError::range_error("Invalid highWaterMark"))
                } else {
                    // Return highWaterMark.
                    Ok(high_water_mark)
                }
            }
        }
    }

    // https://streams.spec.whatwg.org/#make-size-algorithm-from-size-function
    pub(crate) fn extract_size_algorithm(this: Option<&Self>) -> SizeAlgorithm<T> {
        // If strategy["size"] does not exist, return an algorithm that returns 1.
        match this.and_then(|strategy| strategy.size.as_ref()) {
            None => SizeAlgorithm::AlwaysOne,
            Some(size) => SizeAlgorithm::SizeFunction(Rc::clone(size)),
        }
    }
}

/// SizeAlgorithm represents the two ways we might generate sizes - by calling
/// a function or by simply returning 1.0 (the default)
pub(crate) enum SizeAlgorithm<T> {
    AlwaysOne,
    SizeFunction(SizeFunction<T>),
}

impl<T> Clone for SizeAlgorithm<T> {
    fn clone(&self) -> Self {
        match self {
            Self::AlwaysOne => Self::AlwaysOne,
            Self::SizeFunction(f) => Self::SizeFunction(Rc::clone(f)),
        }
    }
}

impl<T> SizeAlgorithm<T> {
    pub(crate) fn call(&self, chunk: &T) -> f64 {
        match self {
            Self::AlwaysOne => 1.0,
            Self::SizeFunction(f) => f(chunk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorName;

    #[test]
    fn missing_high_water_mark_falls_back_to_default() {
        let strategy: Option<&QueuingStrategy<i32>> = None;
        assert_eq!(
            QueuingStrategy::extract_high_water_mark(strategy, 1.0).unwrap(),
            1.0
        );
    }

    #[test]
    fn invalid_high_water_mark_is_a_range_error() {
        for bad in [f64::NAN, -1.0] {
            let strategy = QueuingStrategy::<i32>::with_high_water_mark(bad);
            let err =
                QueuingStrategy::extract_high_water_mark(Some(&strategy), 1.0).unwrap_err();
            assert_eq!(err.name(), ErrorName::RangeError);
        }
        // +∞ is a valid high water mark, unlike for sizes.
        let strategy = QueuingStrategy::<i32>::with_high_water_mark(f64::INFINITY);
        assert_eq!(
            QueuingStrategy::extract_high_water_mark(Some(&strategy), 1.0).unwrap(),
            f64::INFINITY
        );
    }

    #[test]
    fn size_algorithm_defaults_to_one() {
        let algorithm = QueuingStrategy::<&str>::extract_size_algorithm(None);
        assert_eq!(algorithm.call(&"anything"), 1.0);

        let strategy = QueuingStrategy::new().size(|chunk: &&str| chunk.len() as f64);
        let algorithm = QueuingStrategy::extract_size_algorithm(Some(&strategy));
        assert_eq!(algorithm.call(&"four"), 4.0);
    }
}
