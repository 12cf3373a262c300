use crate::nmea::{Sentence, MAX_SENTENCE_LEN};
use crate::ring_buffer::{ByteQueue, SentenceQueue};
use tracing::{debug, warn};

const LF: u8 = 0x0A;

/// Octets retirés de la file à chaque passe
const DRAIN_CHUNK: usize = 64;

/// Assemble les octets reçus en trames NMEA terminées par LF.
///
/// Seule la ligne en cours d'assemblage est conservée d'un appel à l'autre.
/// Les fragments invalides (pas de `$` en tête, ligne trop longue) sont
/// fréquents pendant le démarrage du récepteur : ils sont jetés et
/// journalisés en debug uniquement.
pub struct SentenceAssembler {
    line: [u8; MAX_SENTENCE_LEN],
    len: usize,
    discarded: u64,
}

impl SentenceAssembler {
    pub fn new() -> Self {
        SentenceAssembler {
            line: [0; MAX_SENTENCE_LEN],
            len: 0,
            discarded: 0,
        }
    }

    /// Abandonne la ligne en cours
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Nombre de fragments jetés depuis la création
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Vide entièrement `bytes` et pousse les trames complètes dans `sentences`.
    /// Retourne le nombre de trames ajoutées.
    pub fn drain(&mut self, bytes: &mut ByteQueue, sentences: &mut SentenceQueue) -> usize {
        let mut chunk = [0u8; DRAIN_CHUNK];
        let mut assembled = 0;

        loop {
            let n = bytes.dequeue(&mut chunk);
            if n == 0 {
                return assembled;
            }
            for &byte in &chunk[..n] {
                if self.push_byte(byte, sentences) {
                    assembled += 1;
                }
            }
        }
    }

    /// Ajoute un octet à la ligne en cours ; vrai si une trame a été produite
    fn push_byte(&mut self, byte: u8, sentences: &mut SentenceQueue) -> bool {
        // Deux octets sont réservés pour CR/LF
        if self.len >= MAX_SENTENCE_LEN - 2 {
            debug!("Invalid GPS string received (no terminator in {} bytes)", self.len);
            self.discard();
        }

        // Resynchronisation sur un début de trame au milieu d'un déchet
        if byte == b'$' && self.len > 0 && self.line[0] != b'$' {
            debug!("Discarding {} bytes of garbage before '$'", self.len);
            self.discard();
        }

        self.line[self.len] = byte;
        self.len += 1;

        if byte != LF {
            return false;
        }

        match Sentence::from_bytes(&self.line[..self.len]) {
            Some(sentence) => {
                self.len = 0;
                if let Err(e) = sentences.push(sentence) {
                    warn!("GPS sentence queue flushed: {}", e);
                    return false;
                }
                true
            }
            None => {
                debug!("Invalid GPS string received (missing '$')");
                self.discard();
                false
            }
        }
    }

    fn discard(&mut self) {
        self.discarded += 1;
        self.len = 0;
    }
}

impl Default for SentenceAssembler {
    fn default() -> Self {
        Self::new()
    }
}
