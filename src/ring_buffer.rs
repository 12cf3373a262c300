use thiserror::Error;

/// Capacité de la file d'octets reçus du port série
pub const BYTE_QUEUE_CAPACITY: usize = 100_000;

/// Capacité de la file de trames NMEA complètes
pub const SENTENCE_QUEUE_CAPACITY: usize = 200;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Ring buffer overflow: {requested} items requested, {available} free of {capacity}")]
    Overflow {
        requested: usize,
        available: usize,
        capacity: usize,
    },
}

/// File circulaire FIFO de capacité fixe
///
/// Un seul producteur et un seul consommateur, tous deux dans le thread GPS :
/// aucun verrou n'est nécessaire. En cas de débordement, la file entière est
/// vidée et rien n'est conservé de l'insertion fautive.
pub struct RingBuffer<T> {
    slots: Vec<T>,
    write: usize,
    read: usize,
    count: usize,
}

impl<T: Clone + Default> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            slots: vec![T::default(); capacity],
            write: 0,
            read: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.count
    }

    /// Ajoute tous les éléments, ou aucun
    ///
    /// Si `items` ne tient pas dans l'espace libre, la file est vidée et
    /// l'erreur est renvoyée à l'appelant pour qu'il la journalise.
    pub fn enqueue(&mut self, items: &[T]) -> Result<(), RingBufferError> {
        if items.len() > self.available() {
            let err = RingBufferError::Overflow {
                requested: items.len(),
                available: self.available(),
                capacity: self.capacity(),
            };
            self.flush();
            return Err(err);
        }

        for item in items {
            self.slots[self.write] = item.clone();
            self.write = (self.write + 1) % self.capacity();
        }
        self.count += items.len();

        Ok(())
    }

    /// Ajoute un seul élément (même politique de débordement que `enqueue`)
    pub fn push(&mut self, item: T) -> Result<(), RingBufferError> {
        if self.available() == 0 {
            let err = RingBufferError::Overflow {
                requested: 1,
                available: 0,
                capacity: self.capacity(),
            };
            self.flush();
            return Err(err);
        }

        self.slots[self.write] = item;
        self.write = (self.write + 1) % self.capacity();
        self.count += 1;

        Ok(())
    }

    /// Retire jusqu'à `out.len()` éléments, retourne le nombre réellement retirés
    pub fn dequeue(&mut self, out: &mut [T]) -> usize {
        let n = out.len().min(self.count);
        for slot in out.iter_mut().take(n) {
            *slot = std::mem::take(&mut self.slots[self.read]);
            self.read = (self.read + 1) % self.capacity();
        }
        self.count -= n;
        n
    }

    /// Retire l'élément en tête de file
    pub fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = std::mem::take(&mut self.slots[self.read]);
        self.read = (self.read + 1) % self.capacity();
        self.count -= 1;
        Some(item)
    }

    /// Vide la file (le contenu des cases n'est pas effacé)
    pub fn flush(&mut self) {
        self.write = 0;
        self.read = 0;
        self.count = 0;
    }
}

/// File des octets bruts reçus du récepteur GPS
pub type ByteQueue = RingBuffer<u8>;

/// File des trames NMEA assemblées
pub type SentenceQueue = RingBuffer<crate::nmea::Sentence>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_across_wraparound() {
        let mut q: RingBuffer<u8> = RingBuffer::new(4);
        let mut out = [0u8; 3];

        q.enqueue(&[1, 2, 3]).unwrap();
        assert_eq!(q.dequeue(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);

        // Les écritures repassent par le début du tampon
        q.enqueue(&[4, 5, 6, 7]).unwrap();
        assert_eq!(q.len(), 4);
        let mut out = [0u8; 4];
        assert_eq!(q.dequeue(&mut out), 4);
        assert_eq!(out, [4, 5, 6, 7]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_dequeue_returns_actual_count() {
        let mut q: RingBuffer<u8> = RingBuffer::new(8);
        q.enqueue(b"ab").unwrap();

        let mut out = [0u8; 5];
        assert_eq!(q.dequeue(&mut out), 2);
        assert_eq!(&out[..2], b"ab");
        assert_eq!(q.dequeue(&mut out), 0);
    }

    #[test]
    fn test_overflow_by_one_flushes_everything() {
        let mut q: RingBuffer<u8> = RingBuffer::new(4);
        q.enqueue(&[1, 2]).unwrap();

        let result = q.enqueue(&[3, 4, 5]);
        assert_eq!(
            result,
            Err(RingBufferError::Overflow {
                requested: 3,
                available: 2,
                capacity: 4,
            })
        );
        assert_eq!(q.len(), 0);

        // La file reste utilisable après un débordement
        q.enqueue(&[9]).unwrap();
        assert_eq!(q.pop(), Some(9));
    }

    #[test]
    fn test_count_never_exceeds_capacity() {
        let mut q: RingBuffer<u8> = RingBuffer::new(5);
        let mut expected = std::collections::VecDeque::new();
        let mut next = 0u8;

        for round in 0..50usize {
            let burst = (round * 7) % 4;
            let chunk: Vec<u8> = (0..burst)
                .map(|_| {
                    next = next.wrapping_add(1);
                    next
                })
                .collect();

            match q.enqueue(&chunk) {
                Ok(()) => expected.extend(chunk.iter().copied()),
                Err(_) => expected.clear(),
            }
            assert!(q.len() <= q.capacity());

            if round % 3 == 0 {
                let mut out = [0u8; 2];
                let n = q.dequeue(&mut out);
                for b in &out[..n] {
                    assert_eq!(Some(*b), expected.pop_front());
                }
            }
        }
        assert_eq!(q.len(), expected.len());
    }

    #[test]
    fn test_push_overflow_on_sentence_queue() {
        let mut q: RingBuffer<String> = RingBuffer::new(2);
        q.push("a".to_string()).unwrap();
        q.push("b".to_string()).unwrap();
        assert!(q.push("c".to_string()).is_err());
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }
}
