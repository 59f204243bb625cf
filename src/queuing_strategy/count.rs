use super::QueuingStrategy;

/// Counts every chunk as 1.
/// https://streams.spec.whatwg.org/#cqs-class
#[derive(Clone, Copy, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        // Set this.[[highWaterMark]] to init["highWaterMark"].
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub fn size<T>(_chunk: &T) -> f64 {
        1.0
    }
}

impl<T: 'static> From<CountQueuingStrategy> for QueuingStrategy<T> {
    fn from(strategy: CountQueuingStrategy) -> Self {
        QueuingStrategy::with_high_water_mark(strategy.high_water_mark)
            .size(CountQueuingStrategy::size)
    }
}
