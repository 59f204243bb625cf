use super::QueuingStrategy;

/// Sizes every chunk by its byte length.
/// https://streams.spec.whatwg.org/#blqs-class
#[derive(Clone, Copy, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        // Set this.[[highWaterMark]] to init["highWaterMark"].
        Self { high_water_mark }
    }

    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub fn size<T: AsRef<[u8]>>(chunk: &T) -> f64 {
        chunk.as_ref().len() as f64
    }
}

impl<T: AsRef<[u8]> + 'static> From<ByteLengthQueuingStrategy> for QueuingStrategy<T> {
    fn from(strategy: ByteLengthQueuingStrategy) -> Self {
        QueuingStrategy::with_high_water_mark(strategy.high_water_mark)
            .size(ByteLengthQueuingStrategy::size)
    }
}
